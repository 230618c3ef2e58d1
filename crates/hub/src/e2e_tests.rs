//! Hub and agent sessions talking over loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde_json::{Map, Value, json};

use cstate_agent::{AgentSession, QueryTable, SessionConfig, SessionEvent, StateTable};
use cstate_protocol::AgentIdentity;

use crate::{Hub, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

async fn start_hub() -> Hub {
    Hub::start(ServerConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    })
    .await
    .unwrap()
}

fn session(hub: &Hub, name: &str) -> AgentSession {
    let config = SessionConfig::local(AgentIdentity::new(name), hub.port()).unwrap();
    AgentSession::new(config)
}

/// Opens `name` and waits until the hub has admitted it.
async fn agent(hub: &Hub, name: &str) -> AgentSession {
    let s = session(hub, name);
    s.open();
    admitted(hub, name).await;
    s
}

async fn admitted(hub: &Hub, name: &str) {
    tokio::time::timeout(WAIT, async {
        while !hub.registry().contains(name) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{name} was never admitted"));
}

async fn gone(hub: &Hub, name: &str) {
    tokio::time::timeout(WAIT, async {
        while hub.registry().contains(name) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{name} never left"));
}

/// A round trip through the hub; everything `s` sent before it has been
/// processed once it returns.
async fn sync(s: &AgentSession) {
    tokio::time::timeout(WAIT, s.ask("state").get("clients"))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn bootstrap_agent_lists_clients() {
    let hub = start_hub().await;
    admitted(&hub, "state").await;
    let runner = agent(&hub, "runner").await;

    let clients = runner.ask("state").get("clients").await.unwrap().unwrap();
    let names: Vec<String> = serde_json::from_value(clients).unwrap();
    assert!(names.contains(&"state".to_string()));
    assert!(names.contains(&"runner".to_string()));
}

#[tokio::test]
async fn ask_and_query_reach_target_handlers() {
    let hub = start_hub().await;
    let answer = session(&hub, "answer");
    answer.state_route(StateTable::new().route("testQ", || async { Some(json!(233)) }));
    answer.query_route(
        QueryTable::new()
            .route("plus", |p: Vec<Value>| async move {
                p.first().and_then(Value::as_i64).map(|n| json!(n + 1))
            })
            .route("echo", |p: Vec<Value>| async move { p.into_iter().next() }),
    );
    answer.open();
    admitted(&hub, "answer").await;
    let runner = agent(&hub, "runner").await;

    assert_eq!(runner.ask("answer").get("testQ").await.unwrap(), Some(json!(233)));
    assert_eq!(
        runner.query("answer").call("plus", vec![json!(233)]).await.unwrap(),
        Some(json!(234))
    );

    let v = json!({"deep": [1, "two", {"three": null}]});
    assert_eq!(
        runner.query("answer").call("echo", vec![v.clone()]).await.unwrap(),
        Some(v)
    );
    assert_eq!(runner.ask("answer").get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn unknown_target_resolves_absent() {
    let hub = start_hub().await;
    let runner = agent(&hub, "runner").await;
    assert_eq!(runner.ask("nobody").get("x").await.unwrap(), None);
    assert_eq!(runner.query("nobody").call("x", vec![json!(1)]).await.unwrap(), None);
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let hub = start_hub().await;
    let answer = session(&hub, "answer");
    answer.query_route(QueryTable::new().route("delayed", |p: Vec<Value>| async move {
        let n = p.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(50 - n * 10)).await;
        Some(json!(n))
    }));
    answer.open();
    admitted(&hub, "answer").await;
    let runner = agent(&hub, "runner").await;

    let q = runner.query("answer");
    let (a, b, c) = tokio::join!(
        q.call("delayed", vec![json!(0)]),
        q.call("delayed", vec![json!(1)]),
        q.call("delayed", vec![json!(2)]),
    );
    assert_eq!(a.unwrap(), Some(json!(0)));
    assert_eq!(b.unwrap(), Some(json!(1)));
    assert_eq!(c.unwrap(), Some(json!(2)));
    assert_eq!(runner.pending_requests(), 0);
}

#[tokio::test]
async fn publish_reaches_subscriber() {
    let hub = start_hub().await;
    let publisher = agent(&hub, "pub").await;
    let sub = agent(&hub, "sub").await;

    let topic = sub.subscribe("pub");
    let mut listener = topic.listen();
    sync(&sub).await;

    publisher.publish("a").emit(vec![json!(233)]).unwrap();
    let args = tokio::time::timeout(WAIT, listener.recv_event("a")).await.unwrap();
    assert_eq!(args, Some(vec![json!(233)]));
}

#[tokio::test]
async fn subscriber_without_join_sees_nothing() {
    let hub = start_hub().await;
    let publisher = agent(&hub, "pub").await;
    let other = agent(&hub, "other").await;
    let mut events = other.events();

    publisher.publish("a").emit(vec![json!(1)]).unwrap();
    sync(&publisher).await;
    sync(&other).await;

    while let Ok(ev) = events.try_recv() {
        assert!(!matches!(ev, SessionEvent::Event(_)), "unexpected {ev:?}");
    }
}

#[tokio::test]
async fn joins_are_replayed_after_reopen() {
    let hub = start_hub().await;
    let publisher = agent(&hub, "pub").await;
    let sub = agent(&hub, "sub").await;
    let topic = sub.subscribe("pub");
    sync(&sub).await;

    sub.close();
    gone(&hub, "sub").await;
    assert_eq!(hub.registry().room_size("pub"), 0);

    sub.open();
    admitted(&hub, "sub").await;
    sync(&sub).await;
    assert_eq!(hub.registry().room_size("pub"), 1);

    let mut listener = topic.listen();
    publisher.publish("a").emit(vec![json!(233)]).unwrap();
    let args = tokio::time::timeout(WAIT, listener.recv_event("a")).await.unwrap();
    assert_eq!(args, Some(vec![json!(233)]));
}

#[tokio::test]
async fn log_is_relayed_to_log_group() {
    let hub = start_hub().await;
    let listener = agent(&hub, "listener").await;
    let mut events = listener.events();
    listener.join("log");
    sync(&listener).await;

    let tester = agent(&hub, "tester").await;
    let mut extra = Map::new();
    extra.insert("level".into(), json!("info"));
    tester.log_with("nice", extra).unwrap();

    let log = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Log(log)) = events.recv().await
                && log.name == "tester"
            {
                return log;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(log.raw(), Some("nice"));
    assert_eq!(log.data["level"], json!("info"));
}

#[tokio::test]
async fn lifecycle_is_logged_by_state_agent() {
    let hub = start_hub().await;
    let watcher = agent(&hub, "watcher").await;
    let mut events = watcher.events();
    watcher.subscribe("state");
    sync(&watcher).await;

    let runner = agent(&hub, "runner").await;
    runner.close();
    gone(&hub, "runner").await;

    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while seen.len() < 2 {
            if let Ok(SessionEvent::Log(log)) = events.recv().await
                && log.name == "state"
                && log.data["name"] == json!("runner")
            {
                seen.push(log.raw().unwrap_or_default().to_string());
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec!["connected".to_string(), "disconnect".to_string()]);
}

#[tokio::test]
async fn stats_are_merged_and_queryable() {
    let hub = start_hub().await;
    let runner = agent(&hub, "runner").await;

    let mut report = Map::new();
    report.insert("jobs".into(), json!(3));
    runner.update(report).unwrap();
    sync(&runner).await;

    let mine = runner
        .query("state")
        .call("stats", vec![json!("runner")])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mine["jobs"], json!(3));
    assert!(mine["lastSeen"].as_i64().is_some());

    let all = runner.ask("state").get("stats").await.unwrap().unwrap();
    assert_eq!(all["runner"]["jobs"], json!(3));

    let none = runner.query("state").call("stats", vec![json!("ghost")]).await.unwrap();
    assert_eq!(none, None);
}

#[tokio::test]
async fn heartbeat_reports_uptime() {
    let hub = start_hub().await;
    let config = SessionConfig::local(AgentIdentity::new("beating"), hub.port())
        .unwrap()
        .with_heartbeat_interval(Duration::from_millis(20));
    let s = AgentSession::new(config);
    s.open();
    admitted(&hub, "beating").await;

    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(stats) = hub.registry().stats("beating")
                && stats.get("uptime").and_then(Value::as_f64).is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("uptime reported");
}

#[tokio::test]
async fn duplicate_name_is_not_admitted() {
    let hub = start_hub().await;
    let first = agent(&hub, "dup").await;
    let second = session(&hub, "dup");
    second.open();
    tokio::time::timeout(WAIT, second.wait_connected()).await.unwrap();

    let names = first.ask("state").get("clients").await.unwrap().unwrap();
    let names: Vec<String> = serde_json::from_value(names).unwrap();
    assert_eq!(names.iter().filter(|n| *n == "dup").count(), 1);

    let owner = hub.registry().peer("dup").unwrap();
    second.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.registry().peer("dup").unwrap().conn_id(), owner.conn_id());
}

#[tokio::test]
async fn concurrent_duplicate_names_leave_one_entry() {
    let hub = start_hub().await;
    let a = session(&hub, "dup");
    let b = session(&hub, "dup");
    a.open();
    b.open();
    let (ra, rb) = tokio::join!(
        tokio::time::timeout(WAIT, a.wait_connected()),
        tokio::time::timeout(WAIT, b.wait_connected()),
    );
    ra.unwrap();
    rb.unwrap();
    admitted(&hub, "dup").await;

    let observer = agent(&hub, "observer").await;
    let names = observer.ask("state").get("clients").await.unwrap().unwrap();
    let names: Vec<String> = serde_json::from_value(names).unwrap();
    assert_eq!(names, vec!["dup".to_string(), "observer".to_string(), "state".to_string()]);
    assert_eq!(hub.registry().len(), 3);
}

#[tokio::test]
async fn request_to_departing_target_resolves_absent() {
    let hub = start_hub().await;
    let slow = session(&hub, "slow");
    slow.state_route(StateTable::new().route("wait", || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Some(json!(1))
    }));
    slow.open();
    admitted(&hub, "slow").await;
    let runner = agent(&hub, "runner").await;

    let asker = runner.ask("slow");
    let pending = tokio::spawn(async move { asker.get("wait").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    slow.close();

    let value = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(value.unwrap(), None);
}

#[tokio::test]
async fn requests_sent_offline_are_delivered_after_connect() {
    let hub = start_hub().await;
    admitted(&hub, "state").await;
    let late = session(&hub, "late");
    let asker = late.ask("state");
    let pending = tokio::spawn(async move { asker.get("clients").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    late.open();

    let clients = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    let names: Vec<String> = serde_json::from_value(clients.unwrap()).unwrap();
    assert!(names.contains(&"late".to_string()));
}

#[tokio::test]
async fn close_drops_link_and_fails_in_flight() {
    let hub = start_hub().await;
    let slow = session(&hub, "slow");
    slow.state_route(StateTable::new().route("wait", || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        None
    }));
    slow.open();
    admitted(&hub, "slow").await;
    let runner = agent(&hub, "runner").await;

    let asker = runner.ask("slow");
    let pending = tokio::spawn(async move { asker.get("wait").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    runner.close();

    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(cstate_agent::SessionError::Disconnected)));
    assert!(!runner.is_open());
}
