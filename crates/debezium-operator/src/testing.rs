//! In-process fake of the Kubernetes API server for unit tests

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

type Responder = dyn Fn(&str, &str) -> (u16, Value) + Send + Sync;

/// Records every request and answers with whatever `respond(method, path)` returns
#[derive(Clone)]
pub(crate) struct FakeApiServer {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    respond: Arc<Responder>,
}

impl FakeApiServer {
    pub fn new(respond: impl Fn(&str, &str) -> (u16, Value) + Send + Sync + 'static) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            respond: Arc::new(respond),
        }
    }

    pub fn client(&self) -> Client {
        Client::new(self.clone(), "default")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

/// `metav1.Status` failure body as returned by the API server
pub(crate) fn status_body(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code
    })
}

impl tower::Service<http::Request<Body>> for FakeApiServer {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let requests = self.requests.clone();
        let respond = self.respond.clone();
        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let bytes = req.into_body().collect().await.unwrap().to_bytes();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

            let (status, response_body) = respond(&method, &path);
            requests.lock().push(RecordedRequest { method, path, body });

            let response = http::Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&response_body).unwrap()))
                .unwrap();
            Ok(response)
        })
    }
}
