use httpmock::prelude::*;
use kaiwa_ai::{
    ChatRequest, CredentialProbe, GenerationClient, GenerationConfig, KaiwaAiError, LlmClient,
    Message, SafetySetting, StaticAccessToken, StreamDeltaHandler, VertexAuthMode, VertexClient,
    VertexConfig, ERROR_REPLY,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

const MODEL_PATH: &str =
    "/v1/projects/test-project/locations/us-central1/publishers/google/models/gemini-2.5-flash";

fn vertex_config(server: &MockServer) -> VertexConfig {
    VertexConfig {
        api_base: Some(format!("{}/v1", server.base_url())),
        project_id: "test-project".to_string(),
        location: "us-central1".to_string(),
        request_timeout_ms: 5_000,
    }
}

fn vertex_client(server: &MockServer) -> VertexClient {
    VertexClient::new(
        vertex_config(server),
        Arc::new(StaticAccessToken::new("test-vertex-token").expect("token")),
    )
    .expect("vertex client should be created")
}

fn chat_request() -> ChatRequest {
    ChatRequest {
        model: "gemini-2.5-flash".to_string(),
        messages: vec![Message::system("system"), Message::user("hello")],
        max_tokens: Some(1024),
        temperature: Some(0.7),
        top_p: Some(0.95),
        top_k: Some(40),
        safety_settings: SafetySetting::default_set(),
    }
}

#[tokio::test]
async fn vertex_client_sends_expected_http_request() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{MODEL_PATH}:generateContent"))
            .header("authorization", "Bearer test-vertex-token")
            .json_body_includes(
                json!({
                    "contents": [{"role": "user", "parts": [{"text": "hello"}]}],
                    "systemInstruction": {"parts": [{"text": "system"}]},
                    "generationConfig": {"maxOutputTokens": 1024, "topK": 40},
                    "safetySettings": [
                        {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                        {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                        {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
                        {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"}
                    ]
                })
                .to_string(),
            );

        then.status(200).json_body(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "vertex ok"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 4,
                "candidatesTokenCount": 2,
                "totalTokenCount": 6
            }
        }));
    });

    let response = vertex_client(&server)
        .complete(chat_request())
        .await
        .expect("vertex completion should succeed");

    mock.assert();
    assert_eq!(response.message.text_content(), "vertex ok");
    assert_eq!(response.usage.total_tokens, 6);
}

#[tokio::test]
async fn regression_vertex_client_surfaces_non_success_status() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(format!("{MODEL_PATH}:generateContent"));
        then.status(403)
            .json_body(json!({"error": {"code": 403, "status": "PERMISSION_DENIED"}}));
    });

    let error = vertex_client(&server)
        .complete(chat_request())
        .await
        .expect_err("403 should fail");

    match error {
        KaiwaAiError::HttpStatus { status, body } => {
            assert_eq!(status, 403);
            assert!(body.contains("PERMISSION_DENIED"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn integration_vertex_client_streams_incremental_text_deltas() {
    let server = MockServer::start();
    let stream = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{MODEL_PATH}:streamGenerateContent"))
            .query_param("alt", "sse")
            .header("authorization", "Bearer test-vertex-token");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n"
            ));
    });

    let deltas = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_deltas = deltas.clone();
    let sink: StreamDeltaHandler = Arc::new(move |delta: String| {
        sink_deltas.lock().expect("delta lock").push(delta);
    });

    let response = vertex_client(&server)
        .complete_with_stream(chat_request(), Some(sink))
        .await
        .expect("streaming completion should succeed");

    stream.assert_calls(1);
    assert_eq!(response.message.text_content(), "Hello");
    assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
    assert_eq!(response.usage.total_tokens, 5);
    assert_eq!(
        deltas.lock().expect("delta lock").as_slice(),
        ["Hel".to_string(), "lo".to_string()]
    );
}

#[tokio::test]
async fn functional_generation_client_over_vertex_returns_trimmed_text() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{MODEL_PATH}:generateContent"))
            .json_body_includes(
                json!({"contents": [{"role": "user", "parts": [{"text": "what is rust?"}]}]})
                    .to_string(),
            );
        then.status(200).json_body(json!({
            "candidates": [{
                "content": {"parts": [{"text": "  A systems language.\n"}]},
                "finishReason": "STOP"
            }]
        }));
    });

    let client = GenerationClient::from_vertex_config(&GenerationConfig {
        vertex: vertex_config(&server),
        model: "gemini-2.5-flash".to_string(),
        auth_mode: VertexAuthMode::AccessToken,
        access_token: Some("test-vertex-token".to_string()),
        probe: CredentialProbe::default(),
    });
    assert!(client.is_available());

    let reply = client.generate_response("what is rust?", 1024, 0.7).await;

    mock.assert();
    assert_eq!(reply, "A systems language.");
}

#[tokio::test]
async fn regression_generation_client_maps_http_failure_to_error_reply() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(format!("{MODEL_PATH}:generateContent"));
        then.status(500).body("boom");
    });

    let client = GenerationClient::from_vertex_config(&GenerationConfig {
        vertex: vertex_config(&server),
        model: "gemini-2.5-flash".to_string(),
        auth_mode: VertexAuthMode::AccessToken,
        access_token: Some("test-vertex-token".to_string()),
        probe: CredentialProbe::default(),
    });

    assert_eq!(client.generate_response("hi", 1024, 0.7).await, ERROR_REPLY);
}

/// Answers one request with `chunks` as separate chunked-encoding frames.
fn serve_chunked_once(chunks: Vec<Vec<u8>>) -> String {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("accept");
        let mut request = Vec::new();
        let mut buf = [0_u8; 4096];
        let header_end = loop {
            let read = socket.read(&mut buf).expect("read request");
            assert!(read > 0, "client closed before sending headers");
            request.extend_from_slice(&buf[..read]);
            if let Some(pos) = request.windows(4).position(|window| window == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while request.len() < header_end + content_length {
            let read = socket.read(&mut buf).expect("read body");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buf[..read]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
            )
            .expect("write head");
        for chunk in chunks {
            socket
                .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                .expect("chunk size");
            socket.write_all(&chunk).expect("chunk body");
            socket.write_all(b"\r\n").expect("chunk end");
            socket.flush().expect("flush");
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        socket.write_all(b"0\r\n\r\n").expect("last chunk");
        socket.flush().expect("flush");
    });
    format!("http://{addr}/v1")
}

#[tokio::test]
async fn regression_streaming_reply_survives_multibyte_split_across_chunks() {
    let event = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"café\"}]},\"finishReason\":\"STOP\"}]}\n\n"
        .as_bytes()
        .to_vec();
    let split = event
        .iter()
        .position(|byte| *byte == 0xC3)
        .expect("lead byte of é")
        + 1;
    let api_base = serve_chunked_once(vec![event[..split].to_vec(), event[split..].to_vec()]);

    let client = GenerationClient::from_vertex_config(&GenerationConfig {
        vertex: VertexConfig {
            api_base: Some(api_base),
            project_id: "test-project".to_string(),
            location: "us-central1".to_string(),
            request_timeout_ms: 5_000,
        },
        model: "gemini-2.5-flash".to_string(),
        auth_mode: VertexAuthMode::AccessToken,
        access_token: Some("test-vertex-token".to_string()),
        probe: CredentialProbe::default(),
    });
    let chunks = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_chunks = chunks.clone();
    let sink: StreamDeltaHandler = Arc::new(move |chunk: String| {
        sink_chunks.lock().expect("chunk lock").push(chunk);
    });

    let reply = client
        .generate_streaming_response("say cafe", 1024, 0.7, sink)
        .await;

    assert_eq!(reply, "café");
    assert_eq!(
        chunks.lock().expect("chunk lock").as_slice(),
        ["café".to_string()]
    );
}

#[tokio::test]
async fn integration_service_account_key_file_alone_makes_generation_available() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.method(POST)
            .path("/token")
            .body_includes("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer");
        then.status(200).json_body(json!({
            "access_token": "ya29.key-file",
            "expires_in": 3599,
            "token_type": "Bearer"
        }));
    });
    let generate = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{MODEL_PATH}:generateContent"))
            .header("authorization", "Bearer ya29.key-file");
        then.status(200).json_body(json!({
            "candidates": [{
                "content": {"parts": [{"text": "from a key file"}]},
                "finishReason": "STOP"
            }]
        }));
    });
    let dir = tempfile::tempdir().expect("tempdir");
    let key_path = dir.path().join("service-account.json");
    std::fs::write(
        &key_path,
        json!({
            "type": "service_account",
            "private_key_id": "key-1",
            "private_key": include_str!("../testdata/service-account-key.pem"),
            "client_email": "kaiwa@test-project.iam.gserviceaccount.com",
            "token_uri": server.url("/token")
        })
        .to_string(),
    )
    .expect("write key file");

    let client = GenerationClient::from_vertex_config(&GenerationConfig {
        vertex: vertex_config(&server),
        model: "gemini-2.5-flash".to_string(),
        auth_mode: VertexAuthMode::Auto,
        access_token: None,
        probe: CredentialProbe {
            credentials_file: Some(key_path),
            ..CredentialProbe::default()
        },
    });
    assert!(client.is_available());

    let reply = client.generate_response("hi", 1024, 0.7).await;

    token.assert_calls(1);
    generate.assert_calls(1);
    assert_eq!(reply, "from a key file");
}
