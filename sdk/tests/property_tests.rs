use proptest::prelude::*;
use sdk::errors::{EngineError, EngineErrorExt};
use sdk::types::{Classification, Importance, InboundMessage};

proptest! {
    #[test]
    fn test_error_user_hint_never_leaks_detail(detail in "[a-z/]{8,40}") {
        let errs = vec![
            EngineError::Config(detail.clone()),
            EngineError::StoreUnavailable(detail.clone()),
            EngineError::ReasoningDegraded(detail.clone()),
            EngineError::Network(detail.clone()),
            EngineError::HandlerFault {
                handler: "reminders".to_string(),
                message_id: "m".to_string(),
                reason: detail.clone(),
            },
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&detail));
        }
    }
}

proptest! {
    #[test]
    fn test_classification_confidence_is_clamped(confidence in -10.0f64..10.0) {
        let classification = Classification::new("general", confidence);
        prop_assert!((0.0..=1.0).contains(&classification.confidence));
    }

    #[test]
    fn test_importance_weight_is_monotonic(a in 0i64..4, b in 0i64..4) {
        let (x, y) = (Importance::from_level(a), Importance::from_level(b));
        if x <= y {
            prop_assert!(x.weight() <= y.weight());
        }
    }

    #[test]
    fn test_routing_text_starts_with_body(body in "[a-z ]{0,30}") {
        let message = InboundMessage::new(body.clone());
        prop_assert_eq!(message.routing_text(), body);
    }
}
