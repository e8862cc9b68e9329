//! Maps a free-text model answer onto the obstacle taxonomy.
//!
//! Rules are evaluated top to bottom and the first match wins, because one
//! answer can mention several keyword groups at once. Anything that matches
//! no rule is treated as an unnamed obstacle.

use obstacle_schema::{Classification, TaxonomyTag};

const QUOTES: &[char] = &['"', '\'', '`', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}'];
const TRAILING_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

enum Matcher {
    Contains(&'static [&'static str]),
    ContainsOrEquals {
        contains: &'static [&'static str],
        equals: &'static [&'static str],
    },
}

impl Matcher {
    fn matches(&self, answer: &str) -> bool {
        match self {
            Matcher::Contains(terms) => terms.iter().any(|term| answer.contains(term)),
            Matcher::ContainsOrEquals { contains, equals } => {
                contains.iter().any(|term| answer.contains(term)) || equals.contains(&answer)
            }
        }
    }
}

struct Rule {
    tag: TaxonomyTag,
    matcher: Matcher,
}

const RULES: &[Rule] = &[
    Rule {
        tag: TaxonomyTag::NotAPath,
        matcher: Matcher::Contains(&["not a path", "not_a_path"]),
    },
    Rule {
        tag: TaxonomyTag::Normal,
        matcher: Matcher::ContainsOrEquals {
            contains: &["clear", "passable", "no obstacle"],
            equals: &["no"],
        },
    },
    Rule {
        tag: TaxonomyTag::Construction,
        matcher: Matcher::Contains(&[
            "construction",
            "cone",
            "barrier",
            "sign",
            "fence",
            "work",
            "safety",
        ]),
    },
    Rule {
        tag: TaxonomyTag::Tree,
        matcher: Matcher::Contains(&["tree", "branch", "log", "trunk", "root", "bush", "stump"]),
    },
    Rule {
        tag: TaxonomyTag::Rock,
        matcher: Matcher::Contains(&["rock", "stone", "boulder", "rubble", "brick", "concrete"]),
    },
    Rule {
        tag: TaxonomyTag::Furniture,
        matcher: Matcher::Contains(&[
            "furniture",
            "bench",
            "pole",
            "bollard",
            "planter",
            "pot",
            "box",
            "post",
        ]),
    },
    Rule {
        tag: TaxonomyTag::Slope,
        matcher: Matcher::Contains(&["stairs", "step", "staircase"]),
    },
];

/// Lowercases, drops quote characters and trims trailing punctuation.
pub fn normalize(raw: &str) -> String {
    let unquoted: String = raw
        .chars()
        .filter(|c| !QUOTES.contains(c))
        .collect::<String>()
        .to_lowercase();

    unquoted
        .trim()
        .trim_end_matches(|c: char| TRAILING_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

pub fn classify_normalized(answer: &str) -> TaxonomyTag {
    RULES
        .iter()
        .find(|rule| rule.matcher.matches(answer))
        .map(|rule| rule.tag)
        .unwrap_or(TaxonomyTag::OtherObstacle)
}

pub fn classify(raw_answer: &str) -> Classification {
    Classification::new(classify_normalized(&normalize(raw_answer)))
}
