use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use reqwest::StatusCode;

use remote_flags::{
    Client, ClientConfig, ConfigCache, Error, EvaluationContext, EvaluationError, FetchRequest,
    FetchResponse, InMemoryCache, PollingMode, Result, Transport, User, Value,
};

const COUNTRY: &str = r#"{
    "p": {"s": "salt"},
    "f": {
        "isFeatureEnabled": {"t": 0, "v": {"b": false}, "i": "off", "r": [
            {"c": [{"u": {"a": "Country", "c": 0, "l": ["US"]}}], "s": {"v": {"b": true}, "i": "on"}}
        ]},
        "greeting": {"t": 1, "v": {"s": "hello"}}
    }
}"#;

const CYCLE: &str = r#"{
    "f": {
        "a": {"t": 0, "v": {"b": false}, "r": [
            {"c": [{"p": {"f": "b", "c": 0, "v": {"b": true}}}], "s": {"v": {"b": true}}}
        ]},
        "b": {"t": 0, "v": {"b": false}, "r": [
            {"c": [{"p": {"f": "a", "c": 0, "v": {"b": true}}}], "s": {"v": {"b": true}}}
        ]},
        "c": {"t": 1, "v": {"s": "independent"}}
    }
}"#;

/// Serves a fixed response per base URL and optionally holds every request until released.
#[derive(Default)]
struct Server {
    routes: HashMap<String, (StatusCode, String)>,
    calls: AtomicUsize,
    gate: Option<(Mutex<bool>, Condvar)>,
}

impl Server {
    fn serving(body: &str) -> Server {
        Server::default().route(ClientConfig::DEFAULT_BASE_URL, StatusCode::OK, body)
    }

    fn route(mut self, base_url: &str, status: StatusCode, body: &str) -> Server {
        self.routes
            .insert(base_url.to_owned(), (status, body.to_owned()));
        self
    }

    fn gated(mut self) -> Server {
        self.gate = Some((Mutex::new(false), Condvar::new()));
        self
    }

    fn open(&self) {
        if let Some((open, condvar)) = &self.gate {
            *open.lock().unwrap() = true;
            condvar.notify_all();
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for Server {
    fn get(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((open, condvar)) = &self.gate {
            let mut open = open.lock().unwrap();
            while !*open {
                open = condvar.wait(open).unwrap();
            }
        }

        let url = request.url.as_str();
        let (status, body) = self
            .routes
            .iter()
            .find(|(base, _)| url.starts_with(base.as_str()))
            .map(|(_, route)| route.clone())
            .unwrap_or((StatusCode::NOT_FOUND, String::new()));
        Ok(FetchResponse {
            status,
            etag: None,
            body: body.into_bytes(),
        })
    }
}

fn manual_client(server: Arc<Server>) -> Client {
    let _ = env_logger::builder().is_test(true).try_init();

    ClientConfig::from_sdk_key("sdk-key")
        .polling_mode(PollingMode::Manual)
        .transport(server)
        .to_client()
        .unwrap()
}

fn user(identifier: &str, country: &str) -> Option<Arc<dyn EvaluationContext>> {
    Some(Arc::new(User::new(identifier).with_country(country)))
}

#[test]
fn country_targeting() {
    let client = manual_client(Arc::new(Server::serving(COUNTRY)));
    client.refresh().unwrap();

    assert_eq!(
        client.get_value("isFeatureEnabled", user("u1", "US")),
        Some(Value::Bool(true))
    );
    assert_eq!(
        client.get_value("isFeatureEnabled", user("u2", "DE")),
        Some(Value::Bool(false))
    );

    let details = client.get_value_details("isFeatureEnabled", None);
    assert_eq!(details.value, Some(Value::Bool(false)));
    assert_eq!(details.variation_id.as_deref(), Some("off"));
    assert!(details.is_default_value);
    assert_eq!(details.error, Some(EvaluationError::NoEvaluationContext));
    assert_eq!(details.error.unwrap().to_string(), "User Object missing");
}

#[test]
fn missing_key_and_missing_configuration() {
    let client = manual_client(Arc::new(Server::serving(COUNTRY)));

    let details = client.get_value_details("greeting", None);
    assert_eq!(details.value, None);
    assert_eq!(details.error, Some(EvaluationError::ConfigurationMissing));

    client.refresh().unwrap();
    let details = client.get_value_details("nope", None);
    assert_eq!(details.value, None);
    assert_eq!(
        details.error,
        Some(EvaluationError::KeyNotFound {
            key: "nope".to_owned()
        })
    );
    assert_eq!(
        client.get_all_keys(),
        vec!["greeting".to_owned(), "isFeatureEnabled".to_owned()]
    );
    assert_eq!(
        client.get_key_and_value("on"),
        Some(("isFeatureEnabled".to_owned(), Value::Bool(true)))
    );
}

#[test]
fn circular_prerequisites_are_reported() {
    let client = manual_client(Arc::new(Server::serving(CYCLE)));
    client.refresh().unwrap();

    let details = client.get_value_details("a", user("u", "US"));
    assert_eq!(details.value, Some(Value::Bool(false)));
    assert!(matches!(
        details.error,
        Some(EvaluationError::CircularDependency { .. })
    ));
    assert_eq!(client.get_value("b", None), Some(Value::Bool(false)));
    assert_eq!(
        client.get_value("c", None),
        Some(Value::String("independent".to_owned()))
    );
}

#[test]
fn concurrent_refreshes_share_one_fetch() {
    let server = Arc::new(Server::serving(COUNTRY).gated());
    let client = Arc::new(manual_client(server.clone()));
    let entered = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            let entered = entered.clone();
            std::thread::spawn(move || {
                entered.fetch_add(1, Ordering::SeqCst);
                client.refresh()
            })
        })
        .collect();

    while entered.load(Ordering::SeqCst) < 8 || server.calls() < 1 {
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(50));
    server.open();

    for thread in threads {
        thread.join().unwrap().unwrap();
    }
    assert_eq!(server.calls(), 1);
    assert_eq!(
        client.get_value("greeting", None),
        Some(Value::String("hello".to_owned()))
    );
}

#[test]
fn refresh_timeout_leaves_fetch_running() {
    let server = Arc::new(Server::serving(COUNTRY).gated());
    let client = manual_client(server.clone());

    assert!(matches!(
        client.refresh_with_timeout(Duration::from_millis(20)),
        Err(Error::RefreshTimeout)
    ));
    server.open();
    assert!(client.wait_for_ready(Duration::from_secs(5)));
    assert_eq!(
        client.get_value("greeting", None),
        Some(Value::String("hello".to_owned()))
    );
}

#[test]
fn redirect_loop_is_detected() {
    let a = "https://a.example.com";
    let b = "https://b.example.com";
    let server = Arc::new(
        Server::default()
            .route(
                ClientConfig::DEFAULT_BASE_URL,
                StatusCode::OK,
                &format!(r#"{{"p": {{"u": "{a}", "r": 2}}}}"#),
            )
            .route(a, StatusCode::OK, &format!(r#"{{"p": {{"u": "{b}", "r": 2}}}}"#))
            .route(b, StatusCode::OK, &format!(r#"{{"p": {{"u": "{a}", "r": 2}}}}"#)),
    );
    let client = manual_client(server.clone());

    assert!(matches!(client.refresh(), Err(Error::RedirectLoopDetected)));
    assert!(client.configuration().is_empty());
}

#[test]
fn forced_redirect_is_followed() {
    let eu = ClientConfig::EU_BASE_URL;
    let redirect = format!(r#"{{"p": {{"u": "{eu}", "r": 2}}}}"#);
    let served = COUNTRY.replacen(
        r#""p": {"s": "salt"}"#,
        &format!(r#""p": {{"u": "{eu}", "r": 0, "s": "salt"}}"#),
        1,
    );
    let server = Arc::new(
        Server::default()
            .route(ClientConfig::DEFAULT_BASE_URL, StatusCode::OK, &redirect)
            .route(eu, StatusCode::OK, &served),
    );
    let client = manual_client(server.clone());

    client.refresh().unwrap();
    assert_eq!(server.calls(), 2);
    assert_eq!(
        client.get_value("isFeatureEnabled", user("u", "US")),
        Some(Value::Bool(true))
    );

    // The new base URL sticks.
    client.refresh().unwrap();
    assert_eq!(server.calls(), 3);
}

#[test]
fn not_found_is_an_error_and_keeps_previous_configuration() {
    let client = manual_client(Arc::new(Server::default()));
    assert!(!client.wait_for_ready(Duration::ZERO));
    assert!(matches!(
        client.refresh(),
        Err(Error::UnexpectedStatus(StatusCode::NOT_FOUND))
    ));
    assert!(client.wait_for_ready(Duration::ZERO));
    assert!(client.configuration().is_empty());
    assert_eq!(client.get_value("greeting", None), None);
}

#[test]
fn cache_is_shared_between_clients() {
    let cache = Arc::new(InMemoryCache::new());
    let server = Arc::new(Server::serving(COUNTRY));

    let writer = ClientConfig::from_sdk_key("sdk-key")
        .polling_mode(PollingMode::Manual)
        .transport(server.clone())
        .cache(cache.clone())
        .to_client()
        .unwrap();
    writer.refresh().unwrap();
    assert!(cache
        .get(&remote_flags::cache_key("sdk-key"))
        .unwrap()
        .is_some());

    let offline_server = Arc::new(Server::default());
    let reader = ClientConfig::from_sdk_key("sdk-key")
        .polling_mode(PollingMode::Manual)
        .transport(offline_server.clone())
        .cache(cache.clone())
        .offline(true)
        .to_client()
        .unwrap();
    assert!(reader.is_offline());
    reader.refresh().unwrap();

    assert_eq!(offline_server.calls(), 0);
    assert_eq!(
        reader.get_value("isFeatureEnabled", user("u", "US")),
        Some(Value::Bool(true))
    );
    assert_eq!(
        reader.configuration().fetch_time().timestamp_millis(),
        writer.configuration().fetch_time().timestamp_millis()
    );
}

#[test]
fn offline_without_cache() {
    let server = Arc::new(Server::serving(COUNTRY));
    let client = ClientConfig::from_sdk_key("sdk-key")
        .polling_mode(PollingMode::Manual)
        .transport(server.clone())
        .offline(true)
        .to_client()
        .unwrap();

    assert!(matches!(client.refresh(), Err(Error::OfflineWithoutCache)));
    assert_eq!(server.calls(), 0);

    client.set_online();
    assert!(!client.is_offline());
    client.refresh().unwrap();
    assert_eq!(server.calls(), 1);
}

#[test]
fn hooks_observe_evaluations_and_changes() {
    let evaluated = Arc::new(Mutex::new(Vec::new()));
    let changes = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(Server::serving(COUNTRY));

    let client = {
        let evaluated = evaluated.clone();
        let changes = changes.clone();
        ClientConfig::from_sdk_key("sdk-key")
            .polling_mode(PollingMode::Manual)
            .transport(server)
            .on_flag_evaluated(move |details| {
                evaluated
                    .lock()
                    .unwrap()
                    .push((details.key.clone(), details.value.clone()));
            })
            .on_config_changed(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            })
            .to_client()
            .unwrap()
    };

    client.refresh().unwrap();
    client.refresh().unwrap();
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    let snapshot = client.snapshot(user("u", "US"));
    assert_eq!(snapshot.get_value("isFeatureEnabled"), Some(Value::Bool(true)));
    assert_eq!(snapshot.get_value("isFeatureEnabled"), Some(Value::Bool(true)));
    assert_eq!(
        *evaluated.lock().unwrap(),
        vec![
            ("isFeatureEnabled".to_owned(), Some(Value::Bool(true))),
            ("isFeatureEnabled".to_owned(), Some(Value::Bool(true))),
        ]
    );
}

#[test]
fn snapshot_is_isolated_from_refreshes() {
    let server = Arc::new(Server::serving(COUNTRY));
    let client = manual_client(server);
    let before = client.snapshot(None);

    client.refresh().unwrap();
    assert_eq!(before.get_value("greeting"), None);
    assert!(before.configuration().is_empty());
    assert_eq!(
        client.snapshot(None).get_value("greeting"),
        Some(Value::String("hello".to_owned()))
    );
}

#[test]
fn closed_client_stops_refreshing() {
    let server = Arc::new(Server::serving(COUNTRY));
    let client = ClientConfig::from_sdk_key("sdk-key")
        .polling_mode(PollingMode::AutoPoll {
            interval: Duration::from_secs(60),
            jitter: Duration::ZERO,
        })
        .transport(server.clone())
        .to_client()
        .unwrap();

    assert!(client.wait_for_ready(Duration::from_secs(5)));
    client.close().unwrap();
    assert!(matches!(client.refresh(), Err(Error::Closed)));
    assert_eq!(server.calls(), 1);
    assert_eq!(
        client.get_value("greeting", None),
        Some(Value::String("hello".to_owned()))
    );
}
