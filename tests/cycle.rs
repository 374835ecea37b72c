//! End-to-end cycle tests: the real binary against loopback fakes of the
//! modem's SNMP agent and the RouterOS API, checking the exit-code policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use assert_cmd::Command;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::codec::Framed;

use linkshaper::routeros::wire::{Sentence, SentenceCodec};
use linkshaper::snmp::ber;
use linkshaper::snmp::SnmpValue;

/// UDP agent answering every GET: the downstream OID (`...2.1.8.x`) gets
/// `down`, everything else gets `up`.
async fn spawn_fake_modem(down: u64, up: u64) -> SocketAddr {
    let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = agent.local_addr().unwrap();
    let downstream_oid: linkshaper::snmp::Oid = "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = agent.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = ber::decode_get_request(&buf[..n]) else {
                continue;
            };
            let value = if request.oid == downstream_oid {
                SnmpValue::Gauge32(down)
            } else {
                SnmpValue::Gauge32(up)
            };
            let reply =
                ber::encode_response("public", request.request_id, 0, 0, &request.oid, &value)
                    .unwrap();
            let _ = agent.send_to(&reply, peer).await;
        }
    });
    addr
}

type QueueMap = Arc<Mutex<HashMap<String, (String, u64)>>>;

/// TCP RouterOS answering `/login`, `/queue/tree/print` and
/// `/queue/tree/set`, with shared observable queue state.
async fn spawn_fake_router(queues: &[(&str, &str, u64)]) -> (SocketAddr, QueueMap) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state: QueueMap = Arc::new(Mutex::new(
        queues
            .iter()
            .map(|(id, name, limit)| (name.to_string(), (id.to_string(), *limit)))
            .collect(),
    ));

    let shared = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let mut framed = Framed::new(stream, SentenceCodec::new());
            while let Some(Ok(sentence)) = framed.next().await {
                let command = sentence.first().map(String::as_str).unwrap_or("");
                match command {
                    "/login" => {
                        framed.send(vec!["!done".to_string()]).await.unwrap();
                    }
                    "/queue/tree/print" => {
                        let wanted = sentence
                            .iter()
                            .find_map(|w| w.strip_prefix("?name="))
                            .unwrap_or("");
                        let record: Option<Sentence> = {
                            let state = shared.lock().unwrap();
                            state.get(wanted).map(|(id, limit)| {
                                vec![
                                    "!re".to_string(),
                                    format!("=.id={}", id),
                                    format!("=name={}", wanted),
                                    format!("=max-limit={}", limit),
                                ]
                            })
                        };
                        if let Some(record) = record {
                            framed.send(record).await.unwrap();
                        }
                        framed.send(vec!["!done".to_string()]).await.unwrap();
                    }
                    "/queue/tree/set" => {
                        let id = sentence
                            .iter()
                            .find_map(|w| w.strip_prefix("=.id="))
                            .unwrap()
                            .to_string();
                        let limit: u64 = sentence
                            .iter()
                            .find_map(|w| w.strip_prefix("=max-limit="))
                            .unwrap()
                            .parse()
                            .unwrap();
                        {
                            let mut state = shared.lock().unwrap();
                            for (queue_id, stored) in state.values_mut() {
                                if *queue_id == id {
                                    *stored = limit;
                                }
                            }
                        }
                        framed.send(vec!["!done".to_string()]).await.unwrap();
                    }
                    _ => {
                        framed
                            .send(vec![
                                "!trap".to_string(),
                                "=message=no such command".to_string(),
                            ])
                            .await
                            .unwrap();
                        framed.send(vec!["!done".to_string()]).await.unwrap();
                    }
                }
            }
        }
    });

    (addr, state)
}

/// Run the binary with its config pointed at the fakes, off the runtime
/// threads so the fake servers keep serving.
async fn run_binary(
    modem: SocketAddr,
    router: SocketAddr,
    args: &[&str],
) -> assert_cmd::assert::Assert {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("linkshaper")
            .unwrap()
            .env("LINKSHAPER_MODEM_ADDRESS", modem.ip().to_string())
            .env("LINKSHAPER_MODEM_PORT", modem.port().to_string())
            .env("LINKSHAPER_SNMP_COMMUNITY", "public")
            .env("LINKSHAPER_SNMP_TIMEOUT_SEC", "1")
            .env("LINKSHAPER_ROUTER_ADDRESS", router.ip().to_string())
            .env("LINKSHAPER_ROUTER_PORT", router.port().to_string())
            .env("LINKSHAPER_ROUTER_USERNAME", "admin")
            .env("LINKSHAPER_ROUTER_PASSWORD", "secret")
            .env("LINKSHAPER_ROUTER_TIMEOUT_SEC", "1")
            .args(args)
            .assert()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adjust_applies_limits_and_exits_zero() {
    let modem = spawn_fake_modem(50_676_736, 10_820_608).await;
    let (router, state) = spawn_fake_router(&[
        ("*A0", "download", 50_000_000),
        ("*A1", "upload", 10_000_000),
    ])
    .await;

    run_binary(modem, router, &["adjust"]).await.success();

    let state = state.lock().unwrap();
    assert_eq!(state["download"].1, 45_609_062);
    assert_eq!(state["upload"].1, 9_738_547);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_queue_still_exits_zero() {
    let modem = spawn_fake_modem(50_676_736, 10_820_608).await;
    // Only the upload queue exists.
    let (router, state) = spawn_fake_router(&[("*A1", "upload", 10_000_000)]).await;

    run_binary(modem, router, &["adjust"]).await.success();

    // The present queue was still reconciled.
    let state = state.lock().unwrap();
    assert_eq!(state["upload"].1, 9_738_547);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_modem_exits_nonzero_and_touches_nothing() {
    // An agent that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let modem = silent.local_addr().unwrap();
    let (router, state) = spawn_fake_router(&[("*A0", "download", 50_000_000)]).await;

    run_binary(modem, router, &["adjust"]).await.failure();

    let state = state.lock().unwrap();
    assert_eq!(state["download"].1, 50_000_000);
    drop(silent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dry_run_writes_nothing() {
    let modem = spawn_fake_modem(50_676_736, 10_820_608).await;
    let (router, state) = spawn_fake_router(&[
        ("*A0", "download", 50_000_000),
        ("*A1", "upload", 10_000_000),
    ])
    .await;

    run_binary(modem, router, &["adjust", "--dry-run"])
        .await
        .success();

    let state = state.lock().unwrap();
    assert_eq!(state["download"].1, 50_000_000);
    assert_eq!(state["upload"].1, 10_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_show_reports_without_writing() {
    let modem = spawn_fake_modem(50_676_736, 10_820_608).await;
    let (router, state) = spawn_fake_router(&[
        ("*A0", "download", 50_000_000),
        ("*A1", "upload", 10_000_000),
    ])
    .await;

    let assert = run_binary(modem, router, &["show", "--json"]).await.success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(report["downstream"]["bits_per_second"], 50_676_736u64);
    assert_eq!(report["download"]["proposed_bits"], 45_609_062u64);
    assert_eq!(report["upload"]["current_bits"], 10_000_000u64);

    let state = state.lock().unwrap();
    assert_eq!(state["download"].1, 50_000_000);
    assert_eq!(state["upload"].1, 10_000_000);
}
