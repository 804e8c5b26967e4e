//! Integration tests for the Langbase client and responder
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use followup_agent::config::{LangbaseConfig, RequestConfig};
use followup_agent::error::LangbaseError;
use followup_agent::followup::{
    AssembledContext, LangbaseResponder, ModelRequest, ModelResponder,
};
use followup_agent::langbase::{LangbaseClient, Message, PipeRequest};
use followup_agent::session::ConversationTurn;

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str, timeout_ms: u64) -> LangbaseClient {
    let config = LangbaseConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
    };

    let request_config = RequestConfig {
        timeout_ms,
        max_retries: 0,
        retry_delay_ms: 10,
    };

    LangbaseClient::new(&config, request_config).expect("Failed to create client")
}

/// Create a simple pipe request for testing
fn create_test_request(content: &str) -> PipeRequest {
    PipeRequest::new("follow-up-agent-v1", vec![Message::user(content)])
}

#[cfg(test)]
mod pipe_call_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_pipe_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(header("Content-Type", "application/json"))
            .and(body_partial_json(json!({"name": "follow-up-agent-v1", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "completion": "Which fund are you referring to?",
                "threadId": "thread-123",
                "raw": {
                    "model": "gpt-4o-mini",
                    "usage": {
                        "prompt_tokens": 100,
                        "completion_tokens": 8,
                        "total_tokens": 108
                    }
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        let result = client.call_pipe(&create_test_request("How is my fund doing?")).await;

        assert!(result.is_ok(), "Pipe call should succeed: {:?}", result.err());
        let response = result.unwrap();
        assert!(response.success);
        assert_eq!(response.thread_id, Some("thread-123".to_string()));
        assert_eq!(
            response.into_completion().unwrap(),
            "Which fund are you referring to?"
        );
    }

    #[tokio::test]
    async fn test_client_error_is_not_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Invalid API key"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        let err = client.call_pipe(&create_test_request("q")).await.unwrap_err();

        assert!(matches!(err, LangbaseError::Api { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_and_server_errors_are_transient() {
        for status in [429u16, 500, 503] {
            let mock_server = MockServer::start().await;

            Mock::given(method("POST"))
                .and(path("/v1/pipes/run"))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&mock_server)
                .await;

            let client = create_test_client(&mock_server.uri(), 5000);
            let err = client.call_pipe(&create_test_request("q")).await.unwrap_err();

            assert!(
                matches!(err, LangbaseError::Api { status: s, .. } if s == status),
                "unexpected error for {}: {:?}",
                status,
                err
            );
            assert!(err.is_transient());
        }
    }

    #[tokio::test]
    async fn test_single_attempt_per_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        assert!(client.call_pipe(&create_test_request("q")).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        // Nothing listens on a freshly released port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = create_test_client(&format!("http://127.0.0.1:{}", port), 5000);
        let err = client.call_pipe(&create_test_request("q")).await.unwrap_err();

        assert!(
            matches!(err, LangbaseError::Unavailable { .. }),
            "unexpected error: {:?}",
            err
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        let err = client.call_pipe(&create_test_request("q")).await.unwrap_err();
        assert!(matches!(err, LangbaseError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "completion": "late"}))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 100);
        let err = client.call_pipe(&create_test_request("q")).await.unwrap_err();

        assert!(matches!(err, LangbaseError::Timeout { timeout_ms: 100 }));
        assert!(err.is_transient());
    }
}

#[cfg(test)]
mod pipe_setup_tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_follow_up_pipe_upserts() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .and(body_partial_json(json!({
                "name": "follow-up-agent-v1",
                "upsert": true,
                "json": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "follow-up-agent-v1",
                "description": null,
                "status": "private",
                "owner_login": "team",
                "url": "https://langbase.com/team/follow-up-agent-v1",
                "type": "chat",
                "api_key": "pipe-key"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        client
            .ensure_follow_up_pipe("follow-up-agent-v1", "prompt", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_follow_up_pipe_accepts_conflict() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        assert!(client
            .ensure_follow_up_pipe("follow-up-agent-v1", "prompt", true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ensure_follow_up_pipe_propagates_other_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri(), 5000);
        let err = client
            .ensure_follow_up_pipe("follow-up-agent-v1", "prompt", false)
            .await
            .unwrap_err();
        assert!(matches!(err, LangbaseError::Api { status: 403, .. }));
    }
}

#[cfg(test)]
mod responder_tests {
    use super::*;
    use std::collections::BTreeMap;

    fn model_request() -> ModelRequest {
        let assembled = AssembledContext {
            history: vec![ConversationTurn::user("How is my fund doing?")],
            context_map: BTreeMap::from([("risk_level".to_string(), "moderate".to_string())]),
            current_query: "The large cap one".to_string(),
        };
        ModelRequest::new("Ask for what is missing.", &assembled)
    }

    #[tokio::test]
    async fn test_responder_sends_system_history_and_query() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(body_partial_json(json!({
                "name": "follow-up-agent-v1",
                "messages": [
                    {
                        "role": "system",
                        "content": "Ask for what is missing.\n\nKnown context:\n- risk_level: moderate"
                    },
                    {"role": "user", "content": "How is my fund doing?"},
                    {"role": "user", "content": "The large cap one"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "completion": "Over what timeframe?",
                "threadId": null,
                "raw": null
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let responder = LangbaseResponder::new(
            create_test_client(&mock_server.uri(), 5000),
            "follow-up-agent-v1",
        );
        let text = responder.respond(&model_request()).await.unwrap();
        assert_eq!(text, "Over what timeframe?");
    }

    #[tokio::test]
    async fn test_responder_rejects_unsuccessful_pipe() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "threadId": null,
                "raw": null
            })))
            .mount(&mock_server)
            .await;

        let responder = LangbaseResponder::new(
            create_test_client(&mock_server.uri(), 5000),
            "follow-up-agent-v1",
        );
        let err = responder.respond(&model_request()).await.unwrap_err();
        assert!(matches!(err, LangbaseError::InvalidResponse { .. }));
    }
}
