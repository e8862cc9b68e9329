use crate::{Batch, Classification, ImageRef, ValidationError};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the record (report, post, ...) the images belong to.
///
/// Producers send it either as a number or as a string; it is echoed back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceId {
    Number(i64),
    Text(String),
}

/// Analysis request consumed from the request topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub event_id: String,
    #[serde(default)]
    pub source_id: Option<SourceId>,
    #[serde(default)]
    pub source_table: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl RequestEvent {
    pub fn batch(&self) -> Result<Batch, ValidationError> {
        Batch::new(self.images.clone())
    }
}

/// Analysis result published to the result topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub event_id: String,
    pub occurred_at: NaiveDateTime,
    pub source_service: String,
    #[serde(flatten)]
    pub classification: Classification,
    pub source_id: Option<SourceId>,
    pub source_table: String,
    /// `eventId` of the request this result answers.
    pub correlation_id: String,
}

impl ResultEvent {
    pub fn for_request(
        request: &RequestEvent,
        classification: Classification,
        source_service: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Local::now().naive_local(),
            source_service: source_service.to_string(),
            classification,
            source_id: request.source_id.clone(),
            source_table: request.source_table.clone(),
            correlation_id: request.event_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaxonomyTag;

    fn request() -> RequestEvent {
        serde_json::from_str(
            r#"{
                "eventId": "7f1c0a52-9f3e-4a53-8d0b-1c2f3e4d5a6b",
                "sourceId": 42,
                "images": [
                    {"fileUrl": "http://img/1.jpg", "latitude": 1.0, "longitude": 2.0, "address": "a"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_request_event_defaults() {
        let request = request();
        assert_eq!(request.source_id, Some(SourceId::Number(42)));
        assert_eq!(request.source_table, "");
        assert!(request.batch().is_ok());
    }

    #[test]
    fn test_request_without_images_fails_validation() {
        let request: RequestEvent = serde_json::from_str(r#"{"eventId": "e1", "sourceId": "r-9"}"#).unwrap();
        assert_eq!(request.source_id, Some(SourceId::Text("r-9".into())));
        assert_eq!(request.batch(), Err(ValidationError::EmptyBatch));
    }

    #[test]
    fn test_result_event_references_request() {
        let request = request();
        let result = ResultEvent::for_request(
            &request,
            Classification::new(TaxonomyTag::Rock),
            "image-ai-service",
        );

        assert_eq!(result.correlation_id, request.event_id);
        assert_ne!(result.event_id, request.event_id);
        assert!(Uuid::parse_str(&result.event_id).is_ok());
    }

    #[test]
    fn test_result_event_wire_shape() {
        let result = ResultEvent::for_request(
            &request(),
            Classification::new(TaxonomyTag::Normal),
            "image-ai-service",
        );
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["sourceService"], "image-ai-service");
        assert_eq!(json["analysis_result"], "No");
        assert_eq!(json["is_obstacle"], false);
        assert_eq!(json["tag"], "normal");
        assert_eq!(json["sourceId"], 42);
        assert_eq!(json["sourceTable"], "");
        assert_eq!(json["correlationId"], "7f1c0a52-9f3e-4a53-8d0b-1c2f3e4d5a6b");
        assert!(json["occurredAt"].is_string());

        let back: ResultEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
