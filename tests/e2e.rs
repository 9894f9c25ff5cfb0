mod common;

use axum::http::StatusCode;
use common::{TestApp, expired_token_for, multipart_body, pdf, token_for};
use docquery::{conversation::NOT_READY_MESSAGE, queue::JobStatus};
use serde_json::json;

fn conversation_id(reply: &common::Reply) -> String {
    reply.body["conversationId"]
        .as_str()
        .expect("conversationId")
        .to_string()
}

#[tokio::test]
async fn invoice_is_answerable_only_after_ingestion() {
    let app = TestApp::new().await;
    let token = token_for("user_alice");

    let upload = app
        .upload_pdf(&token, &["Invoice total: $42.00"], None)
        .await;
    assert_eq!(upload.status, StatusCode::OK, "{:?}", upload.body);
    let document_id = upload.body["documentId"].as_str().expect("documentId").to_string();
    assert!(document_id.starts_with("pdf-"));
    assert_eq!(upload.body["locator"]["provider"], "local");
    let job_id = upload.body["jobId"].as_str().expect("jobId").parse().expect("uuid");
    assert_eq!(app.queue.status(job_id).await, Some(JobStatus::Pending));

    let early = app
        .ask(&token, "What is the invoice total?", &document_id, None)
        .await;
    assert_eq!(early.status, StatusCode::OK);
    assert_eq!(early.body["answer"], NOT_READY_MESSAGE);
    let conversation = conversation_id(&early);
    let messages = app
        .get(&format!("/conversations/{conversation}/messages"), Some(&token))
        .await;
    assert_eq!(messages.body["messages"], json!([]));

    let report = app.worker.run_until_idle().await;
    assert_eq!(report.completed, 1);
    assert_eq!(app.queue.status(job_id).await, Some(JobStatus::Completed));

    let answer = app
        .ask(&token, "What is the invoice total?", &document_id, None)
        .await;
    assert_eq!(answer.status, StatusCode::OK);
    assert_eq!(answer.body["answer"], "The invoice total is $42.00.");
    assert_eq!(conversation_id(&answer), conversation);

    let messages = app
        .get(&format!("/conversations/{conversation}/messages"), Some(&token))
        .await;
    let messages = messages.body["messages"].as_array().expect("messages").clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "What is the invoice total?");
    assert_eq!(messages[1]["role"], "assistant");
    assert!(messages[1]["createdAt"].as_str().is_some());

    let metrics = app.get("/metrics", Some(&token)).await;
    assert!(metrics.body.get("documentsIndexed").is_none());
    assert_eq!(metrics.body["answers"], 1);
    assert_eq!(metrics.body["notReadyAnswers"], 1);
}

#[tokio::test]
async fn document_without_text_stays_not_ready() {
    let app = TestApp::new().await;
    let token = token_for("user_scan");

    let upload = app.upload_pdf(&token, &[""], Some("scan.pdf")).await;
    assert_eq!(upload.status, StatusCode::OK, "{:?}", upload.body);

    let report = app.worker.run_until_idle().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.retrying + report.dead, 0);
    assert!(app.index.is_empty().await);

    let reply = app.ask(&token, "Anything in here?", "scan.pdf", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["answer"], NOT_READY_MESSAGE);
    assert!(app.chat.prompts.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn tenants_sharing_a_document_id_stay_isolated() {
    let app = TestApp::new().await;
    let alice = token_for("user_alice");
    let bob = token_for("user_bob");

    let first = app
        .upload_pdf(&alice, &["Invoice total: $42.00"], Some("shared.pdf"))
        .await;
    let second = app
        .upload_pdf(&bob, &["Meeting notes about the roadmap"], Some("shared.pdf"))
        .await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(app.worker.run_until_idle().await.completed, 2);

    let alice_first = app.ask(&alice, "What is the total?", "shared.pdf", None).await;
    let alice_again = app.ask(&alice, "Is it paid?", "shared.pdf", None).await;
    let bob_reply = app.ask(&bob, "What is the total?", "shared.pdf", None).await;

    assert_eq!(alice_first.body["answer"], "The invoice total is $42.00.");
    assert_eq!(bob_reply.body["answer"], "The context does not say.");
    assert_eq!(conversation_id(&alice_first), conversation_id(&alice_again));
    assert_ne!(conversation_id(&alice_first), conversation_id(&bob_reply));

    for prompt in app.chat.prompts.lock().expect("lock").iter() {
        let leaked = prompt.contains("$42.00") && prompt.contains("roadmap");
        assert!(!leaked, "prompt mixed tenants: {prompt}");
    }

    let listed = app.get("/conversations", Some(&alice)).await;
    let conversations = listed.body["conversations"].as_array().expect("list").clone();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["docId"], "shared.pdf");
    assert_eq!(conversations[0]["title"], "What is the total?");

    let forbidden = app
        .get(
            &format!("/conversations/{}/messages", conversation_id(&alice_first)),
            Some(&bob),
        )
        .await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    let continued = app
        .ask(
            &bob,
            "What is the total?",
            "shared.pdf",
            Some(&conversation_id(&alice_first)),
        )
        .await;
    assert_eq!(continued.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn explicit_conversations_bind_on_first_question() {
    let app = TestApp::new().await;
    let token = token_for("user_carol");
    app.upload_pdf(&token, &["Invoice total: $42.00"], Some("a.pdf"))
        .await;
    app.worker.run_until_idle().await;

    let created = app.post_json("/conversations", &token, json!({})).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let id = created.body["conversation"]["id"]
        .as_str()
        .expect("id")
        .to_string();
    assert_eq!(created.body["conversation"]["docId"], serde_json::Value::Null);

    let reply = app
        .ask(&token, "What is the invoice total?", "a.pdf", Some(&id))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(conversation_id(&reply), id);

    let other_doc = app.ask(&token, "And this one?", "b.pdf", Some(&id)).await;
    assert_eq!(other_doc.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        other_doc.body["message"],
        "Conversation is tied to a different document"
    );

    let unknown = app
        .ask(
            &token,
            "Hello?",
            "a.pdf",
            Some("00000000-0000-4000-8000-000000000000"),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_validates_its_body() {
    let app = TestApp::new().await;
    let token = token_for("user_dave");

    let missing_question = app
        .post_json("/chat", &token, json!({ "documentId": "a.pdf" }))
        .await;
    assert_eq!(missing_question.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing_question.body["message"], "Missing question");

    let missing_document = app
        .post_json("/chat", &token, json!({ "question": "Hi" }))
        .await;
    assert_eq!(missing_document.status, StatusCode::BAD_REQUEST);

    let legacy_field = app
        .post_json("/chat", &token, json!({ "question": "Hi", "docId": "a.pdf" }))
        .await;
    assert_eq!(legacy_field.status, StatusCode::OK);
    assert_eq!(legacy_field.body["answer"], NOT_READY_MESSAGE);

    let bad_conversation_id = app
        .post_json(
            "/chat",
            &token,
            json!({ "question": "Hi", "documentId": "a.pdf", "conversationId": "not-a-uuid" }),
        )
        .await;
    assert_eq!(bad_conversation_id.status, StatusCode::BAD_REQUEST);
    assert!(bad_conversation_id.body["message"].is_string());

    let not_json = app
        .post_raw("/chat", &token, "text/plain", "question=Hi")
        .await;
    assert_eq!(not_json.status, StatusCode::BAD_REQUEST);
    assert!(not_json.body["message"].is_string());

    let truncated = app
        .post_raw("/chat", &token, "application/json", "{\"question\": ")
        .await;
    assert_eq!(truncated.status, StatusCode::BAD_REQUEST);
    assert!(truncated.body["message"].is_string());

    let bad_path = app
        .get("/conversations/not-a-uuid/messages", Some(&token))
        .await;
    assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_path.body, json!({ "message": "Invalid path parameter" }));
}

#[tokio::test]
async fn uploads_are_validated_before_storage() {
    let app = TestApp::with_upload_limit(2048).await;
    let token = token_for("user_erin");

    let wrong_type = app
        .upload(
            &token,
            multipart_body("notes.txt", "text/plain", b"hello", None),
        )
        .await;
    assert_eq!(wrong_type.status, StatusCode::BAD_REQUEST);

    let not_pdf = app
        .upload(
            &token,
            multipart_body("fake.pdf", "application/pdf", b"<html></html>", None),
        )
        .await;
    assert_eq!(not_pdf.status, StatusCode::BAD_REQUEST);

    let empty = app
        .upload(&token, multipart_body("empty.pdf", "application/pdf", b"", None))
        .await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);

    let big_text = "lorem ipsum ".repeat(400);
    let oversized = app
        .upload(
            &token,
            multipart_body("big.pdf", "application/pdf", &pdf(&[&big_text]), None),
        )
        .await;
    assert_eq!(oversized.status, StatusCode::BAD_REQUEST);
    assert_eq!(oversized.body["message"], "File too large");

    let bad_id = app
        .upload(
            &token,
            multipart_body("a.pdf", "application/pdf", &pdf(&["x"]), Some("../escape.pdf")),
        )
        .await;
    assert_eq!(bad_id.status, StatusCode::BAD_REQUEST);

    let documents = app.get("/documents", Some(&token)).await;
    assert_eq!(documents.body["documents"], json!([]));
    assert_eq!(app.worker.run_until_idle().await, Default::default());
}

#[tokio::test]
async fn documents_are_listed_per_tenant() {
    let app = TestApp::new().await;
    let alice = token_for("user_alice");
    let bob = token_for("user_bob");

    for id in ["one.pdf", "two.pdf"] {
        let reply = app.upload_pdf(&alice, &["text"], Some(id)).await;
        assert_eq!(reply.status, StatusCode::OK);
    }
    app.upload_pdf(&bob, &["text"], Some("three.pdf")).await;

    let duplicate = app.upload_pdf(&alice, &["text"], Some("one.pdf")).await;
    assert_eq!(duplicate.status, StatusCode::BAD_REQUEST);

    let listed = app.get("/documents", Some(&alice)).await;
    let mut ids: Vec<String> = listed.body["documents"]
        .as_array()
        .expect("documents")
        .iter()
        .map(|doc| doc["id"].as_str().expect("id").to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["one.pdf", "two.pdf"]);
}

#[tokio::test]
async fn protected_routes_reject_bad_credentials_generically() {
    let app = TestApp::new().await;

    let health = app.get("/health", None).await;
    assert_eq!(health.status, StatusCode::OK);

    let tampered = {
        let token = token_for("user_mallory");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            json!({ "sub": "user_admin", "iss": common::ISSUER }).to_string(),
        );
        parts[1] = &forged;
        parts.join(".")
    };
    let unsigned = format!(
        "{}.{}.",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            json!({ "alg": "none" }).to_string()
        ),
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            json!({ "sub": "user_admin", "iss": common::ISSUER }).to_string()
        )
    );

    let no_token = app.get("/documents", None).await;
    assert_eq!(no_token.status, StatusCode::UNAUTHORIZED);
    assert_eq!(no_token.body, json!({ "message": "Unauthorized" }));

    for token in [
        expired_token_for("user_late"),
        tampered,
        unsigned,
        "not-a-jwt".to_string(),
    ] {
        let reply = app.get("/conversations", Some(&token)).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED, "{token}");
        assert_eq!(reply.body, json!({ "message": "Unauthorized" }));
    }

    assert_eq!(app.store.tenant_count().await, 0);
}

#[tokio::test]
async fn rejected_duplicate_upload_keeps_the_original_content() {
    let app = TestApp::new().await;
    let token = token_for("user_frank");

    let original = app
        .upload_pdf(&token, &["Invoice total: $42.00"], Some("inv.pdf"))
        .await;
    assert_eq!(original.status, StatusCode::OK);
    let duplicate = app
        .upload_pdf(&token, &["Nothing relevant here at all"], Some("inv.pdf"))
        .await;
    assert_eq!(duplicate.status, StatusCode::BAD_REQUEST);

    assert_eq!(app.worker.run_until_idle().await.completed, 1);
    let reply = app
        .ask(&token, "What is the invoice total?", "inv.pdf", None)
        .await;
    assert_eq!(reply.body["answer"], "The invoice total is $42.00.");
    for prompt in app.chat.prompts.lock().expect("lock").iter() {
        assert!(!prompt.contains("Nothing relevant"), "{prompt}");
    }
}

#[tokio::test]
async fn upload_can_be_retried_after_the_queue_was_unavailable() {
    let app = TestApp::new().await;
    let token = token_for("user_grace");

    app.set_queue_outage(true);
    let failed = app
        .upload_pdf(&token, &["Invoice total: $42.00"], Some("retry.pdf"))
        .await;
    assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        failed.body,
        json!({ "message": "Failed to enqueue document" })
    );
    let listed = app.get("/documents", Some(&token)).await;
    assert_eq!(listed.body["documents"], json!([]));

    app.set_queue_outage(false);
    let retried = app
        .upload_pdf(&token, &["Invoice total: $42.00"], Some("retry.pdf"))
        .await;
    assert_eq!(retried.status, StatusCode::OK, "{:?}", retried.body);
    assert_eq!(app.worker.run_until_idle().await.completed, 1);

    let reply = app
        .ask(&token, "What is the invoice total?", "retry.pdf", None)
        .await;
    assert_eq!(reply.body["answer"], "The invoice total is $42.00.");
}
