//! Notifier against a local HTTP endpoint with outcomes recorded in a real
//! store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use binwatch_core::config::{ChannelConfig, ChannelKind, NotifyConfig};
use binwatch_core::plugin::Plugin;
use binwatch_core::types::{Alert, DeliveryStatus, Severity, WindowSummary};
use binwatch_notifier::NotifierBuilder;
use binwatch_store::{AlertQuery, ChangeStore};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Answers every request with the next code from `codes`; the last repeats.
async fn http_endpoint(codes: Vec<u16>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let code = codes[n.min(codes.len() - 1)];
            let mut buf = vec![0u8; 64 * 1024];
            let mut read = 0;
            // headers and a small JSON body arrive quickly; read until the
            // declared length is in
            loop {
                let got = sock.read(&mut buf[read..]).await.unwrap_or(0);
                if got == 0 {
                    break;
                }
                read += got;
                let text = String::from_utf8_lossy(&buf[..read]).into_owned();
                if let Some(head) = text.find("\r\n\r\n") {
                    let length = text[..head]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if read >= head + 4 + length {
                        break;
                    }
                }
            }
            let reply = format!("HTTP/1.1 {code} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            let _ = sock.write_all(reply.as_bytes()).await;
        }
    });
    (format!("http://{addr}/alerts"), hits)
}

fn window_alert(id: &str, key: &str) -> Alert {
    let now = Utc::now();
    Alert {
        id: id.to_owned(),
        rule_id: "bulk_change".to_owned(),
        rule_title: "Bulk change".to_owned(),
        severity: Severity::High,
        key: key.to_owned(),
        summary: format!("1001 changes on {key} in 60s"),
        event: None,
        window: Some(WindowSummary {
            group_key: key.to_owned(),
            count: 1001,
            window_secs: 60,
            first_seen: now,
            last_seen: now,
        }),
        channels: vec!["hook".to_owned()],
        created_at: now,
        delivery_status: DeliveryStatus::Pending,
    }
}

fn config(url: &str) -> NotifyConfig {
    NotifyConfig {
        suppression_window_secs: 300,
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        channels: vec![ChannelConfig {
            name: "hook".to_owned(),
            kind: ChannelKind::Webhook,
            url: url.to_owned(),
            timeout_secs: 2,
            ..ChannelConfig::default()
        }],
        ..NotifyConfig::default()
    }
}

fn store(dir: &tempfile::TempDir) -> Arc<ChangeStore> {
    Arc::new(ChangeStore::open_path(dir.path().join("binwatch.db"), Duration::from_secs(1)).unwrap())
}

#[tokio::test]
async fn retried_webhook_delivery_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let (url, hits) = http_endpoint(vec![503, 200]).await;

    let alert = window_alert("w-1", "shop.orders");
    store.append_alert(&alert).unwrap();

    let (tx, rx) = mpsc::channel(8);
    let mut notifier = NotifierBuilder::new(config(&url))
        .store(Arc::clone(&store))
        .alert_receiver(rx)
        .build()
        .unwrap();
    notifier.start().await.unwrap();
    tx.send(alert.clone()).await.unwrap();
    notifier.stop().await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let stored = store.query_alerts(&AlertQuery::default()).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].delivery_status, DeliveryStatus::Delivered);

    let records = store.deliveries("w-1").unwrap();
    let hook = records.iter().find(|r| r.channel.as_deref() == Some("hook")).unwrap();
    assert_eq!(hook.attempts, 2);
}

#[tokio::test]
async fn exhausted_delivery_leaves_alert_failed_and_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let (url, hits) = http_endpoint(vec![500]).await;

    let alert = window_alert("w-2", "shop.orders");
    store.append_alert(&alert).unwrap();

    let (tx, rx) = mpsc::channel(8);
    let mut notifier = NotifierBuilder::new(config(&url))
        .store(Arc::clone(&store))
        .alert_receiver(rx)
        .build()
        .unwrap();
    notifier.start().await.unwrap();
    tx.send(alert).await.unwrap();
    notifier.stop().await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let failed = store
        .query_alerts(&AlertQuery {
            status: Some(DeliveryStatus::Failed),
            ..AlertQuery::default()
        })
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "w-2");
}

#[tokio::test]
async fn burst_of_identical_alerts_sends_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let (url, hits) = http_endpoint(vec![200]).await;

    let (tx, rx) = mpsc::channel(64);
    let mut notifier = NotifierBuilder::new(config(&url))
        .store(Arc::clone(&store))
        .alert_receiver(rx)
        .build()
        .unwrap();
    notifier.start().await.unwrap();
    for i in 0..20 {
        let alert = window_alert(&format!("b-{i}"), "shop.orders");
        store.append_alert(&alert).unwrap();
        tx.send(alert).await.unwrap();
    }
    let other = window_alert("b-other", "shop.payments");
    store.append_alert(&other).unwrap();
    tx.send(other).await.unwrap();
    notifier.stop().await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    let suppressed = store
        .query_alerts(&AlertQuery {
            status: Some(DeliveryStatus::Suppressed),
            ..AlertQuery::default()
        })
        .unwrap();
    assert_eq!(suppressed.len(), 19);
    assert_eq!(notifier.stats().suppressed.load(Ordering::SeqCst), 19);
}
