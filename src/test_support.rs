//! Shared fakes: a local HTTP stub plus recording publisher and alert sender.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::notifications::publisher::{EventPublisher, Payload, PublishError, PublishedEvent};
use crate::notifications::senders::{AlertSender, SenderError};

#[derive(Clone)]
pub struct HttpStub {
    pub url: String,
    hits: Arc<AtomicUsize>,
    status_line: Arc<Mutex<String>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl HttpStub {
    /// Serves `HTTP/1.1 {status_line}` with `body` to every connection.
    pub async fn spawn(status_line: &str, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = Self {
            url: format!("http://{addr}"),
            hits: Arc::new(AtomicUsize::new(0)),
            status_line: Arc::new(Mutex::new(status_line.to_string())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let served = stub.clone();
        let body = body.to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let served = served.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut stream).await.unwrap_or_default();
                    served.requests.lock().unwrap().push(request);
                    served.hits.fetch_add(1, Ordering::SeqCst);
                    let status = served.status_line.lock().unwrap().clone();
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        stub
    }

    pub fn set_status(&self, status_line: &str) {
        *self.status_line.lock().unwrap() = status_line.to_string();
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// A loopback address nothing is listening on.
pub async fn closed_port_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PublishedEvent>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.fail.store(true, Ordering::SeqCst);
        publisher
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn named(&self, event: &str) -> Vec<PublishedEvent> {
        self.events().into_iter().filter(|e| e.event == event).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, channel: &str, event: &str, payload: Payload) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("publisher offline".to_string()));
        }
        self.events.lock().unwrap().push(PublishedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentAlert {
    Email { to: String, subject: String, html: String },
    Sms { to: String, body: String },
}

#[derive(Default)]
pub struct RecordingAlertSender {
    sent: Mutex<Vec<SentAlert>>,
    fail: AtomicBool,
}

impl RecordingAlertSender {
    pub fn failing() -> Self {
        let sender = Self::default();
        sender.fail.store(true, Ordering::SeqCst);
        sender
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, alert: SentAlert) -> Result<(), SenderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SenderError::SendFailed("relay offline".to_string()));
        }
        self.sent.lock().unwrap().push(alert);
        Ok(())
    }
}

#[async_trait]
impl AlertSender for RecordingAlertSender {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<(), SenderError> {
        self.record(SentAlert::Email {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        })
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), SenderError> {
        self.record(SentAlert::Sms {
            to: to.to_string(),
            body: body.to_string(),
        })
    }
}
