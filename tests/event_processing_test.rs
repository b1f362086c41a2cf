mod helpers;

use chrono::{Duration, TimeZone, Utc};
use conduit::domain::models::{Config, ListenerAction, NewEventListener, TaskFilter};
use conduit::Conduit;
use serde_json::json;

use helpers::database::setup_test_db;

async fn conduit(max_daily_executions: u32) -> Conduit {
    let mut config = Config::default();
    config.timezone = "Australia/Sydney".to_string();
    config.events.max_daily_executions = max_daily_executions;
    Conduit::from_pool(config, setup_test_db().await).expect("failed to wire runtime")
}

fn sensor_listener(name: &str) -> NewEventListener {
    NewEventListener::new(
        name,
        "home_assistant",
        ListenerAction::WakeLlm {
            context: Some("the sensor turned on".into()),
        },
        "conv-1",
        "telegram",
    )
    .with_condition("entity_id", json!("sensor.t"))
    .with_condition("new_state.state", json!("on"))
}

#[tokio::test]
async fn test_matching_event_enqueues_llm_callback() {
    let conduit = conduit(5).await;
    let listener = conduit
        .listeners()
        .create_event_listener(sensor_listener("sensor watch"))
        .await
        .unwrap();

    let report = conduit
        .processor()
        .process_event(
            "home_assistant",
            json!({ "entity_id": "sensor.t", "new_state": { "state": "on" } }),
        )
        .await
        .unwrap();
    assert_eq!(report.matched, vec![listener.id]);
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.degraded, 0);

    let tasks = conduit.queue().get_all(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.task_type, "llm_callback");
    assert_eq!(task.payload["callback_context"]["event_data"]["entity_id"], "sensor.t");
    assert_eq!(task.payload["callback_context"]["source"], "home_assistant");
    assert_eq!(task.payload["conversation_id"], "conv-1");
    assert_eq!(task.payload["interface_type"], "telegram");
    assert!(conduit.queue().signal().is_set());

    let stored = conduit
        .events()
        .get(report.event_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.triggered_listener_ids, vec![listener.id]);
}

#[tokio::test]
async fn test_other_sources_and_values_do_not_match() {
    let conduit = conduit(5).await;
    conduit
        .listeners()
        .create_event_listener(sensor_listener("sensor watch"))
        .await
        .unwrap();
    let processor = conduit.processor();

    let wrong_state = processor
        .process_event(
            "home_assistant",
            json!({ "entity_id": "sensor.t", "new_state": { "state": "off" } }),
        )
        .await
        .unwrap();
    let wrong_source = processor
        .process_event(
            "github",
            json!({ "entity_id": "sensor.t", "new_state": { "state": "on" } }),
        )
        .await
        .unwrap();

    assert!(wrong_state.matched.is_empty());
    assert!(wrong_source.matched.is_empty());
    assert!(conduit.queue().get_all(&TaskFilter::default()).await.unwrap().is_empty());

    let recorded = conduit.events().list_recent(None, 10).await.unwrap();
    assert_eq!(recorded.len(), 2);
}

#[tokio::test]
async fn test_daily_cap_refuses_sixth_execution_until_local_midnight() {
    let conduit = conduit(5).await;
    let listener = conduit
        .listeners()
        .create_event_listener(sensor_listener("busy sensor"))
        .await
        .unwrap();
    let processor = conduit.processor();
    let event = json!({ "entity_id": "sensor.t", "new_state": { "state": "on" } });

    // 10:00 local in Sydney (AEDT, UTC+11)
    let morning = Utc.with_ymd_and_hms(2026, 1, 9, 23, 0, 0).unwrap();
    for i in 0..5 {
        let report = processor
            .process_event_at("home_assistant", event.clone(), morning + Duration::minutes(i))
            .await
            .unwrap();
        assert_eq!(report.enqueued.len(), 1, "execution {} should be allowed", i + 1);
    }

    let sixth = processor
        .process_event_at("home_assistant", event.clone(), morning + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(sixth.rate_limited, vec![listener.id]);
    assert!(sixth.enqueued.is_empty());

    // 00:30 local the next day
    let after_midnight = Utc.with_ymd_and_hms(2026, 1, 10, 13, 30, 0).unwrap();
    let next_day = processor
        .process_event_at("home_assistant", event, after_midnight)
        .await
        .unwrap();
    assert_eq!(next_day.enqueued.len(), 1);

    assert_eq!(conduit.queue().get_all(&TaskFilter::default()).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_one_time_listener_fires_once_and_is_disabled() {
    let conduit = conduit(5).await;
    let listener = conduit
        .listeners()
        .create_event_listener(sensor_listener("first arrival").one_time())
        .await
        .unwrap();
    let processor = conduit.processor();
    let event = json!({ "entity_id": "sensor.t", "new_state": { "state": "on" } });

    let first = processor.process_event("home_assistant", event.clone()).await.unwrap();
    assert_eq!(first.enqueued.len(), 1);
    assert_eq!(first.disabled, vec![listener.id]);
    assert!(!conduit.listeners().get(listener.id).await.unwrap().enabled);

    let second = processor.process_event("home_assistant", event.clone()).await.unwrap();
    assert!(second.matched.is_empty());

    // Still disabled after the cache is rebuilt from storage
    processor.refresh_listener_cache().await.unwrap();
    let third = processor.process_event("home_assistant", event).await.unwrap();
    assert!(third.matched.is_empty());
    assert_eq!(conduit.queue().get_all(&TaskFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_listener_without_conditions_matches_every_event_from_source() {
    let conduit = conduit(5).await;
    conduit
        .listeners()
        .create_event_listener(NewEventListener::new(
            "all pushes",
            "github",
            ListenerAction::Script {
                code: "print(event_data)".into(),
                config: json!({}),
            },
            "conv-2",
            "slack",
        ))
        .await
        .unwrap();
    let processor = conduit.processor();

    for payload in [json!({}), json!({ "ref": "main" }), json!([1, 2, 3])] {
        let report = processor.process_event("github", payload).await.unwrap();
        assert_eq!(report.enqueued.len(), 1);
    }

    let scripts = conduit
        .queue()
        .get_all(&TaskFilter {
            task_type: Some("script_execution".into()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(scripts.len(), 3);
}

#[tokio::test]
async fn test_disabled_listener_is_skipped_after_invalidation() {
    let conduit = conduit(5).await;
    let listener = conduit
        .listeners()
        .create_event_listener(sensor_listener("paused"))
        .await
        .unwrap();
    let processor = conduit.processor();
    let event = json!({ "entity_id": "sensor.t", "new_state": { "state": "on" } });

    assert_eq!(processor.process_event("home_assistant", event.clone()).await.unwrap().enqueued.len(), 1);

    conduit.listeners().set_enabled(listener.id, false).await.unwrap();
    processor.invalidate_cache().await;

    let report = processor.process_event("home_assistant", event).await.unwrap();
    assert!(report.matched.is_empty());
}
