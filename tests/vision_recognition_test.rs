//! CAPTCHA recognition against a mocked OpenAI-compatible endpoint.

use serde_json::json;

use verdex::captcha::CaptchaSolver;
use verdex::core::config::VisionConfig;
use verdex::core::Selectors;

fn solver_for(server: &mockito::Server, models: Vec<String>) -> CaptchaSolver {
    let vision = VisionConfig {
        base_url: Some(server.url()),
        api_key: Some(String::new()),
        models: Some(models),
        request_timeout_secs: Some(5),
    };
    CaptchaSolver::new(&vision, Selectors::default()).unwrap()
}

fn completion_body(content: &str) -> String {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

#[tokio::test]
async fn recognize_returns_whitespace_stripped_answer() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body(" xK4 p9 \n"))
        .create_async()
        .await;

    let solver = solver_for(&server, vec!["model-a".to_string()]);
    let answer = solver.recognize(b"fake png bytes").await.unwrap();
    assert_eq!(answer, "xK4p9");
    mock.assert_async().await;
}

#[tokio::test]
async fn recognize_falls_through_to_the_next_model_on_server_error() {
    let mut server = mockito::Server::new_async().await;
    // Route by requested model: the first model errors, the second answers.
    let failing = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::PartialJson(json!({"model": "flaky-model"})))
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;
    let succeeding = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::PartialJson(json!({"model": "steady-model"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body("AB12"))
        .create_async()
        .await;

    let solver = solver_for(
        &server,
        vec!["flaky-model".to_string(), "steady-model".to_string()],
    );
    let answer = solver.recognize(b"fake png bytes").await.unwrap();
    assert_eq!(answer, "AB12");
    failing.assert_async().await;
    succeeding.assert_async().await;
}

#[tokio::test]
async fn recognize_errors_when_every_model_fails() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("unavailable")
        .expect(2)
        .create_async()
        .await;

    let solver = solver_for(
        &server,
        vec!["model-a".to_string(), "model-b".to_string()],
    );
    assert!(solver.recognize(b"fake png bytes").await.is_err());
}

#[tokio::test]
async fn empty_model_answer_is_not_accepted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body("   \n"))
        .expect(1)
        .create_async()
        .await;

    let solver = solver_for(&server, vec!["model-a".to_string()]);
    assert!(solver.recognize(b"fake png bytes").await.is_err());
}
