//! SNMPv2c GET client used to read the modem's attainable-rate counters.
//!
//! One datagram out, one datagram back, no retries: if the modem does not
//! answer within the configured timeout the whole cycle is abandoned and the
//! next scheduled invocation tries again.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::rate::RateSource;

pub mod ber;

pub use ber::{BerError, SnmpValue};

/// Default SNMP agent port.
pub const SNMP_PORT: u16 = 161;

/// An object identifier in dotted-decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn from_arcs(arcs: Vec<u32>) -> Self {
        Self(arcs)
    }

    pub fn arcs(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", arc)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("invalid object identifier {0:?}")]
pub struct OidParseError(String);

impl FromStr for Oid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('.');
        let arcs: Result<Vec<u32>, _> = trimmed.split('.').map(|a| a.parse::<u32>()).collect();
        match arcs {
            Ok(arcs) if arcs.len() >= 2 => Ok(Self(arcs)),
            _ => Err(OidParseError(s.to_string())),
        }
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum SnmpError {
    #[error("I/O error talking to {target}: {source}")]
    Io {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no response from {target} within {timeout:?}")]
    Timeout {
        target: SocketAddr,
        timeout: Duration,
    },
    #[error("malformed response: {0}")]
    Ber(#[from] BerError),
    #[error("agent returned error-status {status} (index {index})")]
    ErrorStatus { status: i64, index: i64 },
    #[error("agent has no value for {0}")]
    NoSuchObject(Oid),
    #[error("counter {oid} holds a non-numeric value: {value:?}")]
    NonNumeric { oid: Oid, value: SnmpValue },
}

/// A one-shot SNMPv2c GET client bound to a single agent.
pub struct SnmpClient {
    target: SocketAddr,
    community: String,
    timeout: Duration,
    request_id: AtomicI64,
}

impl SnmpClient {
    /// Client for the agent at `target`. Use [`SNMP_PORT`] unless the modem
    /// answers somewhere unusual.
    pub fn new(target: SocketAddr, community: &str, timeout: Duration) -> Self {
        Self {
            target,
            community: community.to_string(),
            timeout,
            request_id: AtomicI64::new(1),
        }
    }

    /// Issue a single GET for `oid` and return the decoded varbind value.
    pub async fn get(&self, oid: &Oid) -> Result<SnmpValue, SnmpError> {
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let packet = ber::encode_get_request(&self.community, request_id, oid)?;

        let bind_addr: SocketAddr = if self.target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(|source| SnmpError::Io {
            target: self.target,
            source,
        })?;
        socket
            .connect(self.target)
            .await
            .map_err(|source| SnmpError::Io {
                target: self.target,
                source,
            })?;

        debug!(agent = %self.target, %oid, request_id, "sending SNMP GET");
        socket.send(&packet).await.map_err(|source| SnmpError::Io {
            target: self.target,
            source,
        })?;

        let response = tokio::time::timeout(self.timeout, async {
            let mut buf = vec![0u8; 65_535];
            loop {
                let n = socket.recv(&mut buf).await.map_err(|source| SnmpError::Io {
                    target: self.target,
                    source,
                })?;
                match ber::decode_response(&buf[..n]) {
                    Ok(resp) if resp.request_id == request_id => return Ok::<_, SnmpError>(resp),
                    Ok(resp) => {
                        // Stray or late datagram; keep waiting for ours.
                        debug!(got = resp.request_id, want = request_id, "request-id mismatch, ignoring");
                    }
                    Err(e) => {
                        warn!(agent = %self.target, error = %e, "discarding undecodable datagram");
                    }
                }
            }
        })
        .await
        .map_err(|_| SnmpError::Timeout {
            target: self.target,
            timeout: self.timeout,
        })??;

        if response.error_status != 0 {
            return Err(SnmpError::ErrorStatus {
                status: response.error_status,
                index: response.error_index,
            });
        }
        match response.value {
            SnmpValue::NoSuchObject | SnmpValue::NoSuchInstance | SnmpValue::EndOfMibView => {
                Err(SnmpError::NoSuchObject(oid.clone()))
            }
            value => Ok(value),
        }
    }
}

#[async_trait::async_trait]
impl RateSource for SnmpClient {
    async fn read(&self, metric: &Oid) -> anyhow::Result<i64> {
        let value = self
            .get(metric)
            .await
            .with_context(|| format!("SNMP GET {} against {}", metric, self.target))?;
        value.as_bits().ok_or_else(|| {
            anyhow::Error::from(SnmpError::NonNumeric {
                oid: metric.clone(),
                value,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_parse_and_display() {
        let oid: Oid = "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap();
        assert_eq!(oid.arcs().len(), 14);
        assert_eq!(oid.to_string(), "1.3.6.1.2.1.10.94.1.1.2.1.8.1");
    }

    #[test]
    fn test_oid_leading_dot_accepted() {
        let oid: Oid = ".1.3.6.1".parse().unwrap();
        assert_eq!(oid.to_string(), "1.3.6.1");
    }

    #[test]
    fn test_oid_rejects_garbage() {
        assert!("".parse::<Oid>().is_err());
        assert!("1".parse::<Oid>().is_err());
        assert!("1.3.abc".parse::<Oid>().is_err());
    }

    /// Bind a UDP "agent" that answers the first GET with `value`, echoing the
    /// request-id so the client accepts the reply.
    async fn fake_agent(value: SnmpValue) -> SocketAddr {
        let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = agent.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, peer) = agent.recv_from(&mut buf).await.unwrap();
            let request = ber::decode_get_request(&buf[..n]).unwrap();
            let reply =
                ber::encode_response("x", request.request_id, 0, 0, &request.oid, &value).unwrap();
            agent.send_to(&reply, peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_get_against_local_fake_agent() {
        let addr = fake_agent(SnmpValue::Gauge32(50_676_736)).await;
        let client = SnmpClient::new(addr, "x", Duration::from_secs(2));
        let oid: Oid = "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap();
        let value = client.get(&oid).await.unwrap();
        assert_eq!(value, SnmpValue::Gauge32(50_676_736));
    }

    #[tokio::test]
    async fn test_varbind_exception_is_an_error() {
        let addr = fake_agent(SnmpValue::NoSuchInstance).await;
        let client = SnmpClient::new(addr, "x", Duration::from_secs(2));
        let oid: Oid = "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap();
        match client.get(&oid).await {
            Err(SnmpError::NoSuchObject(_)) => {}
            other => panic!("expected NoSuchObject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_times_out_when_agent_is_silent() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let client = SnmpClient::new(addr, "public", Duration::from_millis(100));
        let oid: Oid = "1.3.6.1.2.1.1.3.0".parse().unwrap();
        match client.get(&oid).await {
            Err(SnmpError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        drop(silent);
    }
}
