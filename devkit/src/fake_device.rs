/*!
Scripted fake battery on localhost

Binds a UDP socket on 127.0.0.1, records every request it receives and
answers according to a per-request script. Lets tests reproduce the
behaviours seen on real batteries: echoes, late answers, stale ids,
garbage and silence.
*/

use anyhow::Result;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::replies::ReplyBuilder;

/// Offset applied to the request id by `Step::Stale`
pub const STALE_ID_OFFSET: u64 = 1000;

/// One thing the device does after receiving a request
#[derive(Debug, Clone)]
pub enum Step {
    /// Sends the request bytes back verbatim
    Echo,
    /// Success reply with the request id and this `result` body
    Reply(Value),
    /// Error reply with the request id
    Error { code: i64, message: String },
    /// Success reply carrying a different id (request id + STALE_ID_OFFSET)
    Stale(Value),
    /// Arbitrary bytes
    Raw(Vec<u8>),
    /// Waits before the next step
    Pause(Duration),
}

/// Fake battery bound to an ephemeral localhost port
pub struct FakeDevice {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    /// Device answering request n with `turns[n]`, then `fallback` for every later request
    pub async fn spawn(turns: Vec<Vec<Step>>, fallback: Vec<Step>) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        let task = tokio::spawn(async move {
            let mut turns = turns.into_iter();
            let mut buf = vec![0u8; 65_535];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("[FAKE] recv failed: {}", e);
                        continue;
                    }
                };
                let request = buf[..len].to_vec();
                let parsed: Value = serde_json::from_slice(&request).unwrap_or(Value::Null);
                let id = parsed.get("id").and_then(Value::as_u64).unwrap_or(0);
                log.lock().unwrap().push(parsed);

                let steps = turns.next().unwrap_or_else(|| fallback.clone());
                for step in steps {
                    let bytes = match step {
                        Step::Echo => request.clone(),
                        Step::Reply(result) => frame(ReplyBuilder::success(id, result)),
                        Step::Error { code, message } => frame(ReplyBuilder::error(id, code, &message)),
                        Step::Stale(result) => {
                            frame(ReplyBuilder::success(id.wrapping_add(STALE_ID_OFFSET), result))
                        }
                        Step::Raw(bytes) => bytes,
                        Step::Pause(delay) => {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    };
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        log::warn!("[FAKE] send to {} failed: {}", peer, e);
                    }
                }
            }
        });

        log::info!("[FAKE] battery listening on {}", addr);
        Ok(Self { addr, received, task })
    }

    /// Device that answers every request with `result`
    pub async fn responsive(result: Value) -> Result<Self> {
        Self::spawn(Vec::new(), vec![Step::Reply(result)]).await
    }

    /// Device that never answers
    pub async fn silent() -> Result<Self> {
        Self::spawn(Vec::new(), Vec::new()).await
    }

    /// Device following `turns`, silent once the script is exhausted
    pub async fn scripted(turns: Vec<Vec<Step>>) -> Result<Self> {
        Self::spawn(turns, Vec::new()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests received so far (non-JSON requests are recorded as null)
    pub fn requests(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Ids of the requests received so far, in arrival order
    pub fn request_ids(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_u64))
            .collect()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn ask(device: &FakeDevice, request: Value) -> Vec<Value> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&serde_json::to_vec(&request).unwrap(), device.addr()).await.unwrap();

        let mut answers = Vec::new();
        let mut buf = vec![0u8; 65_535];
        while let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
        {
            answers.push(serde_json::from_slice(&buf[..len]).unwrap_or(Value::Null));
        }
        answers
    }

    #[tokio::test]
    async fn test_echo_then_reply() {
        let device = FakeDevice::scripted(vec![vec![Step::Echo, Step::Reply(json!({"bat_soc": 50}))]])
            .await
            .unwrap();
        let request = json!({"id": 4, "method": "ES.GetMode", "params": {"id": 0}});

        let answers = ask(&device, request.clone()).await;

        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0], request);
        assert_eq!(answers[1]["id"], 4);
        assert_eq!(answers[1]["result"]["bat_soc"], 50);
        assert_eq!(device.request_ids(), vec![4]);
    }

    #[tokio::test]
    async fn test_stale_reply_uses_other_id() {
        let device = FakeDevice::scripted(vec![vec![Step::Stale(json!({}))]]).await.unwrap();

        let answers = ask(&device, json!({"id": 9, "method": "ES.GetMode", "params": {}})).await;

        assert_eq!(answers[0]["id"], 9 + STALE_ID_OFFSET);
    }

    #[tokio::test]
    async fn test_silent_device_records_requests() {
        let device = FakeDevice::silent().await.unwrap();

        let answers = ask(&device, json!({"id": 1, "method": "ES.GetMode", "params": {}})).await;

        assert!(answers.is_empty());
        assert_eq!(device.request_ids(), vec![1]);
    }
}
