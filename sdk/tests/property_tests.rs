use proptest::prelude::*;
use sdk::errors::{EngineError, EvolverErrorExt};
use sdk::types::{Request, Response};

proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Protocol(error_str.clone()),
            EngineError::DeviceUnreachable(error_str.clone()),
            EngineError::InfeasibleDilution(error_str.clone()),
            EngineError::Fit(error_str.clone()),
            EngineError::Staging(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            // hints are static and never echo the detail
            if error_str.len() > 8 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }
}

proptest! {
    #[test]
    fn test_request_json_roundtrip(
        command in "[a-z_]{1,16}",
        key in "[a-z]{1,8}",
        value in -1_000_000i64..1_000_000,
    ) {
        let req = Request::new(command).with_arg(key, serde_json::json!(value));
        let text = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(req, back);
    }

    #[test]
    fn test_response_json_roundtrip(msg in proptest::option::of("\\PC{0,40}"), ok in any::<bool>()) {
        let resp = match (ok, msg) {
            (true, _) => Response::ok(),
            (false, Some(m)) => Response::error(m),
            (false, None) => Response::with_path("/tmp/staging"),
        };
        let text = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(resp, back);
    }
}
