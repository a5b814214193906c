//! `test-utils` is used for testing `hurdle-lib`, both in its unit tests and
//! in its integration tests.
//! This crate does not depend on `hurdle-lib`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Create a response template serving a challenge page from the `fixtures`
/// directory, with the headers of the protecting edge service
#[macro_export]
macro_rules! challenge_template {
    ($status:expr, $fixture:expr) => {{
        wiremock::ResponseTemplate::new(http::StatusCode::from($status))
            .insert_header("cf-ray", "8a1b2c3d4e5f6a7b-AMS")
            .insert_header("server", "cloudflare")
            .insert_header("content-type", "text/html; charset=UTF-8")
            .set_body_string($crate::load_fixture!($fixture))
    }};
}

/// Helper method to convert a string into a URL
///
/// # Panic
///
/// This panics on error, so it should only be used for testing
#[macro_export]
macro_rules! website {
    ($url:expr) => {{
        url::Url::parse($url).expect("Expected valid Website URL")
    }};
}

/// Get the root path of the project.
#[macro_export]
macro_rules! root_path {
    () => {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .to_path_buf()
    };
}

/// Get the path to the `fixtures` directory.
#[macro_export]
macro_rules! fixtures_path {
    () => {
        $crate::root_path!().join("fixtures")
    };
}

/// Loads a fixture from the `fixtures` directory
#[macro_export]
macro_rules! load_fixture {
    ($filename:expr) => {{
        let path = $crate::fixtures_path!().join($filename);
        std::fs::read_to_string(path).unwrap()
    }};
}
