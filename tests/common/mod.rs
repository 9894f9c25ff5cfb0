#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use docquery::{
    api::{self, ApiLimits, AppState},
    auth::TokenVerifier,
    chat::{ChatClient, ChatError, ChatReply, ChatRequest},
    config::AuthSettings,
    conversation::ConversationEngine,
    embedding::HashingEmbedder,
    identity::IdentityResolver,
    index::InMemoryIndex,
    metrics::CodeMetrics,
    processing::IngestionPipeline,
    queue::{ClaimedJob, FailureDisposition, IngestJob, JobQueue, MemoryJobQueue, QueueError},
    storage::LocalBlobStore,
    store::MemoryStore,
    worker::IngestionWorker,
};
use httpmock::{Method::GET, MockServer};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, traits::PublicKeyParts};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::{
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;
use tower::ServiceExt;

pub const ISSUER: &str = "https://issuer.docquery.test";
pub const KID: &str = "test-key";
pub const DIM: usize = 64;
pub const BOUNDARY: &str = "docquery-test-boundary";

fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test RSA key")
    })
}

fn jwks() -> Value {
    let public = signing_key().to_public_key();
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": KID,
            "alg": "RS256",
            "use": "sig",
            "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }]
    })
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

pub fn sign(header: &Value, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(header.to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = signing_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("sign token");
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

/// Valid RS256 token for `subject`, expiring in five minutes.
pub fn token_for(subject: &str) -> String {
    sign(
        &json!({ "alg": "RS256", "kid": KID, "typ": "JWT" }),
        &json!({
            "sub": subject,
            "iss": ISSUER,
            "exp": now() + 300,
            "nbf": now() - 10,
            "email": format!("{subject}@example.test"),
            "name": subject,
        }),
    )
}

/// Token that expired a minute ago.
pub fn expired_token_for(subject: &str) -> String {
    sign(
        &json!({ "alg": "RS256", "kid": KID }),
        &json!({ "sub": subject, "iss": ISSUER, "exp": now() - 60 }),
    )
}

/// One-page-per-entry PDF with a Helvetica text line on each page.
pub fn pdf(pages: &[&str]) -> Vec<u8> {
    let page_count = pages.len();
    let font_id = 3 + 2 * page_count;
    let mut objects: Vec<String> = vec!["<< /Type /Catalog /Pages 2 0 R >>".into()];
    let kids: Vec<String> = (0..page_count)
        .map(|index| format!("{} 0 R", 3 + 2 * index))
        .collect();
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {page_count} >>",
        kids.join(" ")
    ));
    for (index, text) in pages.iter().enumerate() {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {font_id} 0 R >> >> >>",
            4 + 2 * index
        ));
        let stream = format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET");
        objects.push(format!(
            "<< /Length {} >>\nstream\n{stream}\nendstream",
            stream.len()
        ));
    }
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".into());

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", index + 1).as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_start}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}

/// Multipart body with a `pdf` file part and an optional `documentId` part.
pub fn multipart_body(
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    document_id: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(id) = document_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"documentId\"\r\n\r\n{id}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"pdf\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Chat model that answers from the grounding context it receives.
#[derive(Default)]
pub struct EchoChat {
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatClient for EchoChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let text = if request.system.contains("$42.00") {
            "The invoice total is $42.00.".to_string()
        } else {
            "The context does not say.".to_string()
        };
        self.prompts.lock().expect("lock").push(request.system);
        Ok(ChatReply {
            text,
            model: "echo-model".into(),
        })
    }
}

/// Queue seen by the HTTP side; enqueue fails while `outage` is set.
pub struct SwitchableQueue {
    inner: Arc<MemoryJobQueue>,
    outage: Arc<AtomicBool>,
}

#[async_trait]
impl JobQueue for SwitchableQueue {
    async fn enqueue(&self, job: &IngestJob) -> Result<Uuid, QueueError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.enqueue(job).await
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.inner.claim().await
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.inner.complete(id).await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<FailureDisposition, QueueError> {
        self.inner.fail(id, error).await
    }
}

/// The full HTTP surface over in-memory collaborators plus a worker sharing its queue.
pub struct TestApp {
    pub router: Router,
    pub worker: IngestionWorker,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub queue_outage: Arc<AtomicBool>,
    pub index: Arc<InMemoryIndex>,
    pub chat: Arc<EchoChat>,
    pub jwks_server: MockServer,
    _uploads: tempfile::TempDir,
}

pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl TestApp {
    pub fn set_queue_outage(&self, down: bool) {
        self.queue_outage.store(down, Ordering::SeqCst);
    }

    pub async fn new() -> Self {
        Self::with_upload_limit(10 * 1024 * 1024).await
    }

    pub async fn with_upload_limit(upload_max_bytes: usize) -> Self {
        let jwks_server = MockServer::start_async().await;
        jwks_server
            .mock_async(|when, then| {
                when.method(GET).path("/.well-known/jwks.json");
                then.status(200).json_body(jwks());
            })
            .await;
        let verifier = TokenVerifier::from_settings(&AuthSettings {
            issuer: ISSUER.into(),
            jwks_url: jwks_server.url("/.well-known/jwks.json"),
            audience: None,
            authorized_party: None,
            jwks_cache_ttl: Duration::from_secs(600),
        })
        .expect("verifier");

        let uploads = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(LocalBlobStore::new(uploads.path()));
        let queue = Arc::new(MemoryJobQueue::new(3, Duration::from_secs(300)));
        let index = Arc::new(InMemoryIndex::new(DIM));
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        let chat = Arc::new(EchoChat::default());
        let metrics = Arc::new(CodeMetrics::new());

        let engine = ConversationEngine::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            chat.clone(),
            metrics.clone(),
            2,
        );
        let pipeline = IngestionPipeline::new(
            blobs.clone(),
            embedder,
            index.clone(),
            metrics.clone(),
            1000,
            200,
        );
        let worker = IngestionWorker::new(
            queue.clone(),
            Arc::new(pipeline),
            4,
            Duration::from_millis(10),
        );

        let queue_outage = Arc::new(AtomicBool::new(false));
        let router = api::create_router(AppState {
            verifier: Arc::new(verifier),
            identities: Arc::new(IdentityResolver::new(store.clone())),
            store: store.clone(),
            blobs,
            queue: Arc::new(SwitchableQueue {
                inner: queue.clone(),
                outage: queue_outage.clone(),
            }),
            engine: Arc::new(engine),
            metrics,
            limits: ApiLimits {
                upload_max_bytes,
                documents_page_size: 50,
            },
        });

        Self {
            router,
            worker,
            store,
            queue,
            queue_outage,
            index,
            chat,
            jwks_server,
            _uploads: uploads,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Reply {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Reply { status, body }
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Reply {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).expect("request")).await
    }

    pub async fn post_json(&self, path: &str, token: &str, body: Value) -> Reply {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
    }

    pub async fn post_raw(&self, path: &str, token: &str, content_type: &str, body: &str) -> Reply {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
    }

    pub async fn upload(&self, token: &str, body: Vec<u8>) -> Reply {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/upload")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(body))
                .expect("request"),
        )
        .await
    }

    pub async fn upload_pdf(&self, token: &str, pages: &[&str], document_id: Option<&str>) -> Reply {
        self.upload(
            token,
            multipart_body("invoice.pdf", "application/pdf", &pdf(pages), document_id),
        )
        .await
    }

    pub async fn ask(
        &self,
        token: &str,
        question: &str,
        document_id: &str,
        conversation_id: Option<&str>,
    ) -> Reply {
        let mut body = json!({ "question": question, "documentId": document_id });
        if let Some(id) = conversation_id {
            body["conversationId"] = json!(id);
        }
        self.post_json("/chat", token, body).await
    }
}
