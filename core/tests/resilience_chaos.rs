//! Collaborators that share a host share a breaker: one flapping service
//! trips calls to its neighbours and they recover together.

use core_test_support::test_config;
use pretty_assertions::assert_eq;
use termgate_core::resilience::BreakerState;
use termgate_core::resilience::ClientError;
use termgate_core::resilience::ResilienceServices;
use termgate_core::services::Collaborators;
use termgate_protocol::collab::RagQueryRequest;
use termgate_protocol::collab::TerminalContext;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn rag_request() -> RagQueryRequest {
    RagQueryRequest {
        query: "why is disk full".to_string(),
        user_id: "u1".to_string(),
        area_id: None,
        terminal_context: TerminalContext::default(),
    }
}

#[tokio::test]
async fn failing_rag_trips_the_shared_breaker_and_recovers() {
    let server = MockServer::start().await;
    let mut config = test_config(&server.uri());
    config.breaker.failure_threshold = 2;
    config.breaker.success_threshold = 1;
    config.breaker.open_timeout_secs = 60;
    let resilience = ResilienceServices::new(&config.breaker, &config.retry);
    let collaborators = Collaborators::new(&resilience, &config.services).expect("collaborators");

    let outage = Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount_as_scoped(&server)
        .await;

    for _ in 0..2 {
        let err = collaborators
            .rag
            .query(&rag_request(), None)
            .await
            .expect_err("outage");
        assert!(matches!(err, ClientError::Exhausted { attempts: 2, .. }), "{err}");
    }
    let snapshot = resilience.breakers.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].state, BreakerState::Open);

    // The record service lives on the same host, so it fails fast too.
    let err = collaborators
        .records
        .recent_area("u1", None)
        .await
        .expect_err("circuit open");
    assert!(matches!(err, ClientError::CircuitOpen { .. }), "{err}");
    assert!(err.is_unavailable());
    drop(outage);
}

#[tokio::test]
async fn half_open_trial_closes_the_circuit() {
    let server = MockServer::start().await;
    let mut config = test_config(&server.uri());
    config.breaker.failure_threshold = 1;
    config.breaker.success_threshold = 1;
    config.breaker.open_timeout_secs = 0;
    config.retry.max_retries = 0;
    let resilience = ResilienceServices::new(&config.breaker, &config.retry);
    let collaborators = Collaborators::new(&resilience, &config.services).expect("collaborators");

    {
        let _outage = Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(500))
            .mount_as_scoped(&server)
            .await;
        collaborators
            .rag
            .query(&rag_request(), None)
            .await
            .expect_err("outage");
    }
    assert_eq!(resilience.breakers.snapshot()[0].state, BreakerState::Open);

    Mock::given(method("GET"))
        .and(path("/users/u1/recent-area"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let area = collaborators
        .records
        .recent_area("u1", None)
        .await
        .expect("trial call");
    assert_eq!(area, None);
    assert_eq!(resilience.breakers.snapshot()[0].state, BreakerState::Closed);
}
