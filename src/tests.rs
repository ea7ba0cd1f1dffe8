use crate::auth::AuthManager;
use crate::callback::CallbackListener;
use crate::client::RtmClient;
use crate::config::{AuthMode, Config};
use crate::error::Error;
use crate::model::{flatten_tasks, NameIndex};
use crate::protocol::*;
use crate::ratelimit::RateLimiter;
use crate::service::RtmService;
use crate::storage::{FileStorage, TokenStorage};

use std::sync::Arc;

use chrono::TimeZone;
use mockito::Matcher;
use serde_json::from_str;

fn auth_ok_body(token: &str, username: &str) -> String {
    format!(
        r#"{{"rsp":{{"stat":"ok","auth":{{"token":"{token}","perms":"delete","user":{{"id":"1","username":"{username}","fullname":"{username} T. Monkey"}}}}}}}}"#
    )
}

fn temp_storage() -> (tempfile::TempDir, Arc<FileStorage>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Arc::new(FileStorage::with_path(dir.path().join("rtm_token.json")));
    (dir, storage)
}

async fn test_service(server: &mockito::Server, storage: Arc<FileStorage>) -> RtmService {
    let config = Config::new("key", "secret");
    RtmService::for_test(config, &server.url(), &server.url(), storage)
        .await
        .expect("service boot")
}

#[test]
fn deser_check_token() {
    let json_rsp = r#"{"rsp":{"stat":"ok","auth":{"token":"410c57262293e9d937ee5be75eb7b0128fd61b61","perms":"delete","user":{"id":"1","username":"bob","fullname":"Bob T. Monkey"}}}}"#;
    let status = from_str::<RtmResponse<RspStatus>>(json_rsp).unwrap().rsp;
    assert_eq!(status.stat, Stat::Ok);
    assert_eq!(status.err, None);
    let ar = from_str::<RtmResponse<AuthResponse>>(json_rsp).unwrap().rsp;
    assert_eq!(ar.auth.token, "410c57262293e9d937ee5be75eb7b0128fd61b61");
    assert_eq!(ar.auth.user.id, "1");
    assert_eq!(ar.auth.user.username, "bob");
    assert_eq!(ar.auth.user.fullname, "Bob T. Monkey");
}

#[test]
fn deser_failure_envelope() {
    let json_rsp = r#"{"rsp":{"stat":"fail","err":{"code":"98","msg":"Login failed / Invalid auth token"}}}"#;
    let status = from_str::<RtmResponse<RspStatus>>(json_rsp).unwrap().rsp;
    assert_eq!(status.stat, Stat::Fail);
    let err = status.err.unwrap();
    assert_eq!(err.code, 98);
    assert_eq!(err.msg, "Login failed / Invalid auth token");
}

#[test]
fn deser_taskseries() {
    let json = r#"
           {"id":"blahid",
            "created":"2020-01-01T16:00:00Z",
            "modified":"2020-01-02T13:12:15Z",
            "name":"Do the thing",
            "source":"android",
            "url":"",
            "location_id":"",
            "tags":{"tag":["computer"]},
            "participants":[],
            "notes":[],
            "rrule":{"every":"1","$t":"FREQ=WEEKLY;INTERVAL=1;WKST=MO"},
            "parent_task_id": "",
            "task":[
              {"id":"my_task_id","due":"2020-01-12T00:00:00Z","has_due_time":"0","added":"2020-01-10T16:00:56Z","completed":"2020-01-12T13:12:11Z","deleted":"","priority":"N","postponed":"0","estimate":""}
            ]
           }"#;
    let series = from_str::<WireTaskSeries>(json).unwrap();
    assert_eq!(series.id, "blahid");
    assert_eq!(series.name, "Do the thing");
    assert_eq!(
        series.created,
        Some(chrono::Utc.with_ymd_and_hms(2020, 1, 1, 16, 0, 0).unwrap())
    );
    assert_eq!(series.tags, vec!["computer".to_string()]);
    assert!(series.notes.is_empty());
    assert_eq!(
        series.rrule,
        Some(WireRrule {
            every: true,
            rule: "FREQ=WEEKLY;INTERVAL=1;WKST=MO".into(),
        })
    );
    assert_eq!(series.task.len(), 1);
    let task = &series.task[0];
    assert_eq!(task.id, "my_task_id");
    assert_eq!(
        task.due,
        Some(chrono::Utc.with_ymd_and_hms(2020, 1, 12, 0, 0, 0).unwrap())
    );
    assert!(!task.has_due_time);
    assert!(task.completed.is_some());
    assert_eq!(task.deleted, "");
    assert_eq!(task.priority, 0);
    assert_eq!(task.postponed, 0);
    assert_eq!(task.estimate, None);
}

#[test]
fn deser_rrule_shapes() {
    // Object form.
    let rule = from_str::<WireRrule>(r#"{"every":"1","$t":"FREQ=WEEKLY;INTERVAL=1"}"#).unwrap();
    assert!(rule.every);
    assert_eq!(rule.rule, "FREQ=WEEKLY;INTERVAL=1");

    // Absent, null, empty string and bare string forms, via the series.
    let series = |rrule: &str| {
        from_str::<WireTaskSeries>(&format!(
            r#"{{"id":"s","name":"n","task":[],{rrule}"tags":[]}}"#
        ))
        .unwrap()
    };
    assert_eq!(series("").rrule, None);
    assert_eq!(series(r#""rrule":null,"#).rrule, None);
    assert_eq!(series(r#""rrule":"","#).rrule, None);
    let named = series(r#""rrule":"FREQ=DAILY","#);
    assert_eq!(
        named.rrule,
        Some(WireRrule {
            every: false,
            rule: "FREQ=DAILY".into(),
        })
    );
}

#[test]
fn deser_priority_values() {
    let task = |priority: &str| {
        from_str::<WireTask>(&format!(r#"{{"id":"t","priority":"{priority}"}}"#)).unwrap()
    };
    assert_eq!(task("N").priority, 0);
    assert_eq!(task("1").priority, 1);
    assert_eq!(task("2").priority, 2);
    assert_eq!(task("3").priority, 3);
    // Anything else maps to none rather than failing the parse.
    assert_eq!(task("9").priority, 0);
    assert_eq!(task("urgent").priority, 0);
}

#[test]
fn deser_bad_timestamp_is_dropped_not_fatal() {
    let task = from_str::<WireTask>(
        r#"{"id":"t","due":"not-a-date","completed":"2020-01-10T16:00:56Z"}"#,
    )
    .unwrap();
    assert_eq!(task.due, None);
    assert!(task.completed.is_some());
}

#[test]
fn deser_tasklist_response_notes_object_and_array() {
    // One series carries notes in the wrapped-object shape, the other as a
    // bare array; both must yield exactly one note.
    let json = r#"{"rsp": { "stat": "ok",
           "tasks": {"rev": "my_rev",
                     "list": [
                       {"id": "my_list_id",
                        "taskseries": [
                            {"id":"s1",
                             "name":"First",
                             "notes":{
                                "note":[
                                {"id":"n1","created":"2024-01-01T00:00:00Z","modified":"2024-01-01T00:00:00Z","title":"","$t":"hello"}]},
                             "task":[{"id":"t1","due":"","deleted":"","priority":"N"}]},
                            {"id":"s2",
                             "name":"Second",
                             "notes":[
                                {"id":"n2","created":"2024-01-02T00:00:00Z","modified":"2024-01-02T00:00:00Z","title":"","$t":"world"}],
                             "task":[{"id":"t2","due":"","deleted":"","priority":"N"}]}
                         ]}
                     ]}}}"#;
    let rsp = from_str::<RtmResponse<TasksResponse>>(json).unwrap().rsp;
    let tasks = flatten_tasks(rsp.tasks, &NameIndex::default());
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].notes.len(), 1);
    assert_eq!(tasks[0].notes[0].text, "hello");
    assert_eq!(tasks[1].notes.len(), 1);
    assert_eq!(tasks[1].notes[0].text, "world");
}

#[test]
fn deser_notes_tolerates_odd_shapes() {
    let series = |notes: &str| {
        from_str::<WireTaskSeries>(&format!(
            r#"{{"id":"s","name":"n","task":[],"notes":{notes}}}"#
        ))
        .unwrap()
    };
    assert!(series("null").notes.is_empty());
    assert!(series(r#""""#).notes.is_empty());
    assert!(series("[]").notes.is_empty());
    assert!(series("{}").notes.is_empty());
    // A single note inside the wrapper, not wrapped in an array.
    let single = series(r#"{"note":{"id":"n1","title":"","$t":"only"}}"#);
    assert_eq!(single.notes.len(), 1);
    assert_eq!(single.notes[0].text, "only");
    // Unrecognised shapes degrade to empty instead of failing.
    assert!(series("42").notes.is_empty());
}

#[test]
fn flatten_skips_deleted_instances() {
    let json = r#"{"rsp":{"stat":"ok","tasks":{"rev":"r","list":[
        {"id":"l1","taskseries":[
            {"id":"s1","name":"Kept","task":[{"id":"t1","deleted":""}]},
            {"id":"s2","name":"Gone","task":[{"id":"t2","deleted":"2024-01-01T00:00:00Z"}]}
        ]}]}}}"#;
    let rsp = from_str::<RtmResponse<TasksResponse>>(json).unwrap().rsp;
    let tasks = flatten_tasks(rsp.tasks, &NameIndex::default());
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "s1_t1");
    assert_eq!(tasks[0].name, "Kept");
}

#[test]
fn deser_lists_response() {
    let json = r#"{"rsp":{"stat":"ok","lists":{"list":[
        {"id":"l1","name":"Inbox","deleted":"0","locked":"1","archived":"0","position":"-1","smart":"0"},
        {"id":"l2","name":"A-List","deleted":"0","locked":"0","archived":"0","position":"0","smart":"1"}
    ]}}}"#;
    let rsp = from_str::<RtmResponse<ListsResponse>>(json).unwrap().rsp;
    assert_eq!(rsp.lists.list.len(), 2);
    let inbox = &rsp.lists.list[0];
    assert!(inbox.locked);
    assert!(!inbox.smart);
    assert_eq!(inbox.position, -1);
    assert!(rsp.lists.list[1].smart);
}

#[test]
fn deser_tags_response_mixed_shapes() {
    let named = r#"{"rsp":{"stat":"ok","tags":{"tag":[{"name":"errand"},{"name":"home"}]}}}"#;
    let rsp = from_str::<RtmResponse<TagsResponse>>(named).unwrap().rsp;
    assert_eq!(rsp.tags.tag, vec!["errand".to_string(), "home".to_string()]);

    let plain = r#"{"rsp":{"stat":"ok","tags":{"tag":["errand","home"]}}}"#;
    let rsp = from_str::<RtmResponse<TagsResponse>>(plain).unwrap().rsp;
    assert_eq!(rsp.tags.tag, vec!["errand".to_string(), "home".to_string()]);
}

#[test]
fn deser_settings_response() {
    let json = r#"{"rsp":{"stat":"ok","settings":{
        "timezone":"Europe/London","dateformat":"0","timeformat":"1",
        "defaultlist":"l1","language":"en-GB","defaultduedate":"today","pro":"1"}}}"#;
    let rsp = from_str::<RtmResponse<SettingsResponse>>(json).unwrap().rsp;
    assert_eq!(rsp.settings.timezone, "Europe/London");
    assert!(!rsp.settings.dateformat);
    assert!(rsp.settings.timeformat);
    assert_eq!(rsp.settings.defaultlist, "l1");
    assert!(rsp.settings.pro);
}

#[tokio::test]
async fn rtm_failure_envelope_becomes_rtm_error() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.auth.checkToken".into(),
        ))
        .with_body(r#"{"rsp":{"stat":"fail","err":{"code":"98","msg":"Login failed / Invalid auth token"}}}"#)
        .create_async()
        .await;

    let client = RtmClient::with_endpoints(
        "key",
        "secret",
        &server.url(),
        &server.url(),
        RateLimiter::new(1000.0, 1000),
    )
    .unwrap();
    client.set_token("tok");
    let err = client
        .call::<AuthResponse>("rtm.auth.checkToken", vec![])
        .await
        .unwrap_err();
    assert!(err.is_invalid_token());
}

#[tokio::test]
async fn http_503_maps_to_rate_limited() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(mockito::Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let client = RtmClient::with_endpoints(
        "key",
        "secret",
        &server.url(),
        &server.url(),
        RateLimiter::new(1000.0, 1000),
    )
    .unwrap();
    let err = client
        .call::<FrobResponse>("rtm.auth.getFrob", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)));
}

#[tokio::test]
async fn garbage_body_is_invalid_response() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(mockito::Matcher::Any)
        .with_body("<rsp>not json</rsp>")
        .create_async()
        .await;

    let client = RtmClient::with_endpoints(
        "key",
        "secret",
        &server.url(),
        &server.url(),
        RateLimiter::new(1000.0, 1000),
    )
    .unwrap();
    let err = client
        .call::<FrobResponse>("rtm.auth.getFrob", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
}

// Scenario: fresh install with valid credentials and no stored token.
#[tokio::test]
async fn fresh_install_start_auth() {
    let mut server = mockito::Server::new_async().await;
    let frob_mock = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.getFrob".into()),
            Matcher::UrlEncoded("format".into(), "json".into()),
            Matcher::UrlEncoded("api_key".into(), "key".into()),
            Matcher::Regex("api_sig=[0-9a-f]{32}".into()),
        ]))
        .with_body(r#"{"rsp":{"stat":"ok","frob":"F1"}}"#)
        .expect(1)
        .create_async()
        .await;

    let (_dir, storage) = temp_storage();
    let service = test_service(&server, storage).await;

    assert!(!service.auth_state().authenticated);

    let flow = service.start_auth().await.unwrap();
    assert_eq!(flow.frob, "F1");
    assert!(flow.url.contains("api_key=key"));
    assert!(flow.url.contains("perms=delete"));
    assert!(flow.url.contains("frob=F1"));
    let sig = flow.url.split("api_sig=").nth(1).unwrap();
    assert_eq!(sig.len(), 32);
    assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));

    // Only getFrob has gone to RTM.
    frob_mock.assert_async().await;
}

// Scenario: interactive completion with a fixed frob and token.
#[tokio::test]
async fn interactive_completion_persists_verified_token() {
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.getToken".into()),
            Matcher::UrlEncoded("frob".into(), "F1".into()),
        ]))
        .with_body(auth_ok_body("T1", "alice"))
        .expect(1)
        .create_async()
        .await;
    let check_mock = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.checkToken".into()),
            Matcher::UrlEncoded("auth_token".into(), "T1".into()),
        ]))
        .with_body(auth_ok_body("T1", "alice"))
        .expect(1)
        .create_async()
        .await;

    let (_dir, storage) = temp_storage();
    let service = test_service(&server, storage.clone()).await;

    let state = service.complete_auth("F1").await.unwrap();
    assert!(state.authenticated);
    assert_eq!(state.username, "alice");

    let stored = storage.load().unwrap().expect("token persisted");
    assert_eq!(stored.token, "T1");
    assert_eq!(stored.username, "alice");

    // The cached state answers without another token exchange.
    assert!(service.auth_state().authenticated);
    token_mock.assert_async().await;
    check_mock.assert_async().await;
}

// Scenario: a stale stored token is cleared on boot.
#[tokio::test]
async fn stale_stored_token_is_cleared_at_boot() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.checkToken".into()),
            Matcher::UrlEncoded("auth_token".into(), "T_stale".into()),
        ]))
        .with_body(r#"{"rsp":{"stat":"fail","err":{"code":"98","msg":"Login failed / Invalid auth token"}}}"#)
        .create_async()
        .await;

    let (_dir, storage) = temp_storage();
    storage.save("T_stale", "1", "alice").unwrap();

    let service = test_service(&server, storage.clone()).await;
    assert!(!service.auth_state().authenticated);
    assert_eq!(storage.load().unwrap(), None);
}

#[tokio::test]
async fn clear_auth_is_idempotent() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    storage.save("T1", "1", "alice").unwrap();
    // No checkToken mock: boot verification fails over transport and the
    // stored token survives, but the service stays unauthenticated.
    let service = test_service(&server, storage.clone()).await;

    service.clear_auth().unwrap();
    service.clear_auth().unwrap();
    assert_eq!(storage.load().unwrap(), None);
    assert!(!service.auth_state().authenticated);
}

#[tokio::test]
async fn set_auth_token_verifies_and_persists() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.checkToken".into()),
            Matcher::UrlEncoded("auth_token".into(), "T9".into()),
        ]))
        .with_body(auth_ok_body("T9", "bob"))
        .create_async()
        .await;

    let (_dir, storage) = temp_storage();
    let service = test_service(&server, storage.clone()).await;

    let state = service.set_auth_token("T9").await.unwrap();
    assert!(state.authenticated);
    assert_eq!(state.username, "bob");
    assert_eq!(storage.load().unwrap().unwrap().token, "T9");
}

async fn seed_authenticated(
    server: &mut mockito::Server,
    storage: &Arc<FileStorage>,
) -> mockito::Mock {
    storage.save("T1", "1", "alice").unwrap();
    server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.checkToken".into()),
            Matcher::UrlEncoded("auth_token".into(), "T1".into()),
        ]))
        .with_body(auth_ok_body("T1", "alice"))
        .create_async()
        .await
}

// Scenario: default-view fallback walks the strategy ladder in order and
// stops at the first non-empty result.
#[tokio::test]
async fn default_view_falls_back_to_incomplete_everywhere() {
    let mut server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let _check = seed_authenticated(&mut server, &storage).await;

    let _settings = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.settings.getList".into(),
        ))
        .with_body(
            r#"{"rsp":{"stat":"ok","settings":{"timezone":"UTC","dateformat":"1","timeformat":"0","defaultlist":"L1","language":"en-US","defaultduedate":"","pro":"0"}}}"#,
        )
        .create_async()
        .await;
    let _lists = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.lists.getList".into(),
        ))
        .with_body(
            r#"{"rsp":{"stat":"ok","lists":{"list":[{"id":"L1","name":"Work","deleted":"0","locked":"0","archived":"0","position":"0","smart":"0"}]}}}"#,
        )
        .expect_at_least(1)
        .create_async()
        .await;

    // The pipeline serialises caller parameters first, so the unscoped
    // incomplete filter leads the query string; the list-scoped strategy
    // starts with list_id instead and cannot match this mock.
    let two_tasks = server
        .mock("GET", "/")
        .match_query(Matcher::Regex("^filter=status%3Aincomplete&".into()))
        .with_body(
            r#"{"rsp":{"stat":"ok","tasks":{"rev":"r","list":[
                {"id":"L2","taskseries":[
                    {"id":"s1","name":"One","task":[{"id":"t1","deleted":""}]},
                    {"id":"s2","name":"Two","task":[{"id":"t2","deleted":""}]}
                ]}]}}}"#,
        )
        .expect(1)
        .create_async()
        .await;
    let by_name = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.getList".into()),
            Matcher::UrlEncoded("filter".into(), "list:\"Work\" AND status:incomplete".into()),
        ]))
        .with_body(r#"{"rsp":{"stat":"ok","tasks":{"rev":"r","list":[]}}}"#)
        .expect(1)
        .create_async()
        .await;
    let by_id = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.getList".into()),
            Matcher::UrlEncoded("list_id".into(), "L1".into()),
            Matcher::UrlEncoded("filter".into(), "status:incomplete".into()),
        ]))
        .with_body(r#"{"rsp":{"stat":"ok","tasks":{"rev":"r","list":[]}}}"#)
        .expect(1)
        .create_async()
        .await;

    let service = test_service(&server, storage).await;
    let page = service.get_tasks(None).await.unwrap();

    assert_eq!(page.total_found, 2);
    assert_eq!(page.returned, 2);
    assert!(!page.truncated);
    assert!(page.message.contains("2"));

    by_id.assert_async().await;
    by_name.assert_async().await;
    two_tasks.assert_async().await;
}

#[tokio::test]
async fn filtered_get_tasks_resolves_list_names() {
    let mut server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let _check = seed_authenticated(&mut server, &storage).await;

    let _tasks = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.getList".into()),
            Matcher::UrlEncoded("filter".into(), "status:incomplete".into()),
        ]))
        .with_body(
            r#"{"rsp":{"stat":"ok","tasks":{"rev":"r","list":[
                {"id":"L1","taskseries":[{"id":"s1","name":"One","task":[{"id":"t1","deleted":""}]}]}
            ]}}}"#,
        )
        .create_async()
        .await;
    let _lists = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.lists.getList".into(),
        ))
        .with_body(
            r#"{"rsp":{"stat":"ok","lists":{"list":[{"id":"L1","name":"Work","deleted":"0","locked":"0","archived":"0","position":"0","smart":"0"}]}}}"#,
        )
        .create_async()
        .await;

    let service = test_service(&server, storage).await;
    let page = service.get_tasks(Some("status:incomplete")).await.unwrap();
    assert_eq!(page.tasks.len(), 1);
    assert_eq!(page.tasks[0].id, "s1_t1");
    assert_eq!(page.tasks[0].list_name, "Work");
}

#[tokio::test]
async fn create_task_uses_fresh_timeline() {
    let mut server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let _check = seed_authenticated(&mut server, &storage).await;

    let timeline = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.timelines.create".into(),
        ))
        .with_body(r#"{"rsp":{"stat":"ok","timeline":"TL1"}}"#)
        .expect(1)
        .create_async()
        .await;
    let add = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.add".into()),
            Matcher::UrlEncoded("timeline".into(), "TL1".into()),
            Matcher::UrlEncoded("name".into(), "Buy milk".into()),
            Matcher::UrlEncoded("parse".into(), "0".into()),
        ]))
        .with_body(
            r#"{"rsp":{"stat":"ok","transaction":{"id":"tx1","undoable":"0"},"list":
                {"id":"L1","taskseries":[{"id":"s9","name":"Buy milk","task":[{"id":"t9","deleted":""}]}]}}}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let service = test_service(&server, storage).await;
    let task = service.create_task("Buy milk", None, false).await.unwrap();
    assert_eq!(task.id, "s9_t9");
    assert_eq!(task.name, "Buy milk");
    assert_eq!(task.list_id, "L1");

    timeline.assert_async().await;
    add.assert_async().await;
}

#[tokio::test]
async fn complete_task_splits_the_external_id() {
    let mut server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let _check = seed_authenticated(&mut server, &storage).await;

    let _timeline = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.timelines.create".into(),
        ))
        .with_body(r#"{"rsp":{"stat":"ok","timeline":"TL2"}}"#)
        .create_async()
        .await;
    let complete = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.complete".into()),
            Matcher::UrlEncoded("timeline".into(), "TL2".into()),
            Matcher::UrlEncoded("list_id".into(), "L1".into()),
            Matcher::UrlEncoded("taskseries_id".into(), "s9".into()),
            Matcher::UrlEncoded("task_id".into(), "t9".into()),
        ]))
        .with_body(
            r#"{"rsp":{"stat":"ok","transaction":{"id":"tx2","undoable":"1"},"list":
                {"id":"L1","taskseries":[{"id":"s9","name":"Buy milk","task":[{"id":"t9","deleted":"","completed":"2024-01-01T00:00:00Z"}]}]}}}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let service = test_service(&server, storage).await;
    service.complete_task("L1", "s9_t9").await.unwrap();
    complete.assert_async().await;
}

#[tokio::test]
async fn add_tags_joins_tags_with_commas() {
    let mut server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let _check = seed_authenticated(&mut server, &storage).await;

    let _timeline = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.timelines.create".into(),
        ))
        .with_body(r#"{"rsp":{"stat":"ok","timeline":"TL3"}}"#)
        .create_async()
        .await;
    let tag = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.tasks.addTags".into()),
            Matcher::UrlEncoded("tags".into(), "errand,urgent".into()),
        ]))
        .with_body(
            r#"{"rsp":{"stat":"ok","list":{"id":"L1","taskseries":[{"id":"s9","name":"Buy milk","task":[{"id":"t9","deleted":""}]}]}}}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let service = test_service(&server, storage).await;
    service
        .add_tags("L1", "s9_t9", &["errand".into(), "urgent".into()])
        .await
        .unwrap();
    tag.assert_async().await;

    let err = service.add_tags("L1", "s9_t9", &[]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArguments(_)));
}

#[tokio::test]
async fn headless_mode_fails_with_instructions() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();

    let mut config = Config::new("key", "secret");
    config.mode = AuthMode::Headless;
    let service = RtmService::for_test(config, &server.url(), &server.url(), storage)
        .await
        .unwrap();

    let err = service.ensure_authenticated().await.unwrap_err();
    assert!(matches!(err, Error::AuthRequired(_)));
    assert!(err.to_string().contains("RTM_AUTH_TOKEN"));
}

#[tokio::test]
async fn write_with_malformed_task_id_never_reaches_the_wire() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let service = test_service(&server, storage).await;

    for bad in ["s9", "s9_", "_t9", "s9_t9_extra"] {
        let err = service.complete_task("L1", bad).await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidArguments(_)),
            "expected InvalidArguments for {bad:?}"
        );
    }
}

#[tokio::test]
async fn get_tasks_requires_a_token() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let service = test_service(&server, storage).await;

    let err = service.get_tasks(None).await.unwrap_err();
    assert!(matches!(err, Error::AuthRequired(_)));
}

#[tokio::test]
async fn ci_test_mode_returns_synthetic_user() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();

    std::env::set_var("CI", "1");
    let mut config = Config::new("key", "secret");
    config.mode = AuthMode::Test;
    let service = RtmService::for_test(config, &server.url(), &server.url(), storage)
        .await
        .unwrap();

    let outcome = service.ensure_authenticated().await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.username, "ci_test_user");
    // No verified session was invented.
    assert!(!service.auth_state().authenticated);
}

// The callback listener drives the frob exchange from a browser redirect.
#[tokio::test]
async fn callback_listener_completes_the_flow() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "rtm.auth.getToken".into()),
            Matcher::UrlEncoded("frob".into(), "F1".into()),
        ]))
        .with_body(auth_ok_body("T1", "alice"))
        .create_async()
        .await;
    let _check = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded(
            "method".into(),
            "rtm.auth.checkToken".into(),
        ))
        .with_body(auth_ok_body("T1", "alice"))
        .create_async()
        .await;

    let (_dir, storage) = temp_storage();
    let client = Arc::new(
        RtmClient::with_endpoints(
            "key",
            "secret",
            &server.url(),
            &server.url(),
            RateLimiter::new(1000.0, 1000),
        )
        .unwrap(),
    );
    let auth = Arc::new(AuthManager::new(
        client,
        storage.clone(),
        Config::new("key", "secret"),
    ));

    let listener = CallbackListener::start(Arc::clone(&auth), "F1".into(), "127.0.0.1", 0)
        .await
        .unwrap();
    let addr = listener.local_addr();

    let browser = tokio::spawn(async move {
        reqwest::get(format!("http://{addr}/callback?frob=F1"))
            .await
            .expect("callback request")
    });

    let state = listener
        .wait(std::time::Duration::from_secs(10))
        .await
        .unwrap();
    assert!(state.authenticated);
    assert_eq!(state.username, "alice");
    assert_eq!(storage.load().unwrap().unwrap().token, "T1");

    let response = browser.await.unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn callback_listener_rejects_non_get() {
    let server = mockito::Server::new_async().await;
    let (_dir, storage) = temp_storage();
    let client = Arc::new(
        RtmClient::with_endpoints(
            "key",
            "secret",
            &server.url(),
            &server.url(),
            RateLimiter::new(1000.0, 1000),
        )
        .unwrap(),
    );
    let auth = Arc::new(AuthManager::new(client, storage, Config::new("key", "secret")));

    let listener = CallbackListener::start(Arc::clone(&auth), "F1".into(), "127.0.0.1", 0)
        .await
        .unwrap();
    let addr = listener.local_addr();

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/callback"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
}
