#[cfg(test)]
mod challenges {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use http::StatusCode;
    use hurdle_lib::{
        ChallengeType, ClientBuilder, ClientConfig, ErrorKind, ReqwestTransport, Transport,
        challenge::UnsupportedReason,
    };
    use test_utils::{challenge_template, load_fixture, mock_server, website};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(config: ClientConfig) -> hurdle_lib::Client {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new().unwrap());
        ClientBuilder::builder()
            .config(config)
            .transport(transport)
            .build()
            .client()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unprotected_site() {
        let mock_server = mock_server!(StatusCode::OK, set_body_string("<html>hello</html>"));
        let client = client(ClientConfig::default());

        let response = client.get(&mock_server.uri()).await.unwrap();
        assert_eq!(response.response.status, StatusCode::OK);
        assert_eq!(response.response.body, "<html>hello</html>");
        assert!(response.challenge.is_none());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_javascript_challenge_end_to_end() {
        let mock_server = MockServer::start().await;
        let host = website!(&mock_server.uri()).host_str().unwrap().to_string();
        // The script computes 10 + 5, the answer adds the length of the host
        let answer = (15 + host.len()).to_string();

        let page = load_fixture!("challenges/javascript.html").replace("}, 4000);", "}, 100);");
        Mock::given(method("GET"))
            .and(path("/protected"))
            .respond_with(
                challenge_template!(StatusCode::SERVICE_UNAVAILABLE, "challenges/javascript.html")
                    .set_body_string(page),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn-cgi/l/chk_jschl"))
            .and(query_param("jschl_answer", answer.as_str()))
            .and(query_param("jschl_vc", "abc123"))
            .and(query_param("pass", "1620000000.123-Ab1Cd2Ef3G"))
            .respond_with(ResponseTemplate::new(StatusCode::OK).set_body_string("<html>welcome</html>"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client(ClientConfig::default());
        let start = Instant::now();
        let response = client
            .get(&format!("{}/protected", mock_server.uri()))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(response.response.status, StatusCode::OK);
        assert_eq!(response.response.body, "<html>welcome</html>");
        let challenge = response.challenge.unwrap();
        assert!(challenge.success);
        assert_eq!(challenge.attempts, 1);
        assert_eq!(challenge.challenge_type, ChallengeType::JavaScript);

        let metrics = client.metrics();
        assert_eq!(metrics.performance.challenges[&ChallengeType::JavaScript].solved, 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_with_retry_after() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(
                challenge_template!(StatusCode::TOO_MANY_REQUESTS, "challenges/rate_limited.html")
                    .insert_header("retry-after", "2"),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(StatusCode::OK).set_body_string("finally"))
            .mount(&mock_server)
            .await;

        let client = client(ClientConfig::default());
        let start = Instant::now();
        let response = client
            .get(&format!("{}/limited", mock_server.uri()))
            .await
            .unwrap();
        let waited = start.elapsed();

        // Retry-After of 2s, jittered by a factor in [0.5, 1.5]
        assert!(waited >= Duration::from_secs(1), "{waited:?}");
        assert!(waited <= Duration::from_secs(4), "{waited:?}");
        assert_eq!(response.response.body, "finally");
        let challenge = response.challenge.unwrap();
        assert!(challenge.success);
        assert_eq!(challenge.attempts, 1);
        assert_eq!(challenge.challenge_type, ChallengeType::RateLimited);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_turnstile_is_reported_not_solved() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(challenge_template!(StatusCode::FORBIDDEN, "challenges/turnstile.html"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client(ClientConfig::default());
        let err = client.get(&mock_server.uri()).await.unwrap_err();
        let ErrorKind::ChallengeUnresolved(result) = err else {
            panic!("expected an unresolved challenge, got {err}");
        };
        assert!(!result.success);
        assert_eq!(result.challenge_type, ChallengeType::Turnstile);
        assert!(matches!(
            result.error,
            Some(ErrorKind::UnsolvableChallenge(
                ChallengeType::Turnstile,
                UnsupportedReason::Disabled
            ))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_export() {
        let mock_server = mock_server!(StatusCode::OK);
        let client = client(ClientConfig::default());
        for _ in 0..3 {
            client.get(&mock_server.uri()).await.unwrap();
        }
        client.shutdown().await;

        let json: serde_json::Value =
            serde_json::from_str(&client.metrics().to_json().unwrap()).unwrap();
        assert_eq!(json["concurrency"]["completed_tasks"], 3);
        assert_eq!(json["performance"]["total_requests"], 3);
        assert_eq!(json["performance"]["status_codes"]["200"], 3);
        assert_eq!(json["rate_limits"]["global"]["admitted"], 3);
    }
}
