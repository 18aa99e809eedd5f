//! Integration tests for cron scheduling and template rendering.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use notify_scheduler::Error;
use notify_scheduler::database::models::{Metadata, NewScheduledJob, NewTemplate};
use notify_scheduler::database::repositories::{
    SqlxQueueRepository, SqlxScheduledJobRepository, SqlxTemplateRepository,
};
use notify_scheduler::database::time::datetime_to_ms;
use notify_scheduler::database::{DbPool, init_pool_with_size, run_migrations};
use notify_scheduler::queue::NotificationQueue;
use notify_scheduler::scheduler::{JOB_NAME_KEY, Scheduler, SchedulerConfig};
use notify_scheduler::template::TemplateEngine;

struct Harness {
    pool: DbPool,
    scheduler: Scheduler,
    queue: NotificationQueue,
    templates: Arc<TemplateEngine>,
}

async fn harness() -> Harness {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let queue = NotificationQueue::new(Arc::new(SqlxQueueRepository::new(pool.clone())));
    let templates = Arc::new(TemplateEngine::new(Arc::new(SqlxTemplateRepository::new(
        pool.clone(),
    ))));
    let scheduler = Scheduler::new(
        Arc::new(SqlxScheduledJobRepository::new(pool.clone())),
        queue.clone(),
        templates.clone(),
        SchedulerConfig::default(),
    );

    Harness {
        pool,
        scheduler,
        queue,
        templates,
    }
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

fn services() -> Vec<String> {
    vec!["json://localhost/hook".to_string()]
}

#[tokio::test]
async fn test_missed_ticks_fire_once() {
    let h = harness().await;
    let job = h
        .scheduler
        .add_at(
            NewScheduledJob::new("every-5", "*/5 * * * *", services()).with_message("ping", ""),
            at(9, 58),
        )
        .await
        .unwrap();
    assert_eq!(job.next_run, Some(datetime_to_ms(at(10, 0))));

    // Offline from 10:00 to 10:14; 10:00, 10:05 and 10:10 were missed.
    let queued = h.scheduler.tick_at(at(10, 15)).await.unwrap();
    assert_eq!(queued.len(), 1);

    let job = h.scheduler.get(job.id).await.unwrap();
    assert_eq!(job.run_count, 1);
    assert_eq!(job.last_run, Some(datetime_to_ms(at(10, 15))));
    assert_eq!(job.next_run, Some(datetime_to_ms(at(10, 20))));
    assert_eq!(h.queue.stats().await.unwrap().total(), 1);

    // Nothing more until 10:20.
    assert!(h.scheduler.tick_at(at(10, 19)).await.unwrap().is_empty());
    assert_eq!(h.scheduler.tick_at(at(10, 20)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_restart_skips_missed_occurrences() {
    let h = harness().await;
    let job = h
        .scheduler
        .add_at(NewScheduledJob::new("hourly", "0 * * * *", services()), at(8, 30))
        .await
        .unwrap();
    assert_eq!(job.next_run, Some(datetime_to_ms(at(9, 0))));

    // A new process comes up at 11:45 and loads the stored jobs.
    let restarted = Scheduler::new(
        Arc::new(SqlxScheduledJobRepository::new(h.pool.clone())),
        h.queue.clone(),
        h.templates.clone(),
        SchedulerConfig::default(),
    );
    assert_eq!(restarted.load_at(at(11, 45)).await.unwrap(), 1);
    assert_eq!(restarted.next_wakeup(), Some(at(12, 0)));
    assert!(restarted.tick_at(at(11, 46)).await.unwrap().is_empty());

    let job = restarted.get(job.id).await.unwrap();
    assert_eq!(job.run_count, 0);
    assert_eq!(job.next_run, Some(datetime_to_ms(at(12, 0))));
}

#[tokio::test]
async fn test_run_count_tracks_ticks() {
    let h = harness().await;
    let job = h
        .scheduler
        .add_at(NewScheduledJob::new("minutely", "* * * * *", services()), at(0, 0))
        .await
        .unwrap();

    for minute in 1..=7 {
        let queued = h.scheduler.tick_at(at(0, minute)).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    let job = h.scheduler.get(job.id).await.unwrap();
    assert_eq!(job.run_count, 7);
    assert_eq!(h.queue.stats().await.unwrap().total(), 7);
}

#[tokio::test]
async fn test_tick_renders_template_into_queue() {
    let h = harness().await;
    h.templates
        .create(
            &NewTemplate::new("alert", "Alert: {{alert_type}}", "Severity {{ severity | upper }}")
                .with_variable("alert_type", "CPU")
                .with_variable("severity", "medium"),
        )
        .await
        .unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("alert_type".into(), "Disk".into());
    h.scheduler
        .add_at(
            NewScheduledJob::new("disk-alert", "*/10 * * * *", services())
                .with_template("alert")
                .with_metadata(metadata),
            at(9, 55),
        )
        .await
        .unwrap();

    let queued = h.scheduler.tick_at(at(10, 0)).await.unwrap();
    let row = h.queue.get(queued[0]).await.unwrap();
    assert_eq!(row.title, "Alert: Disk");
    assert_eq!(row.body, "Severity MEDIUM");
    assert_eq!(
        row.metadata().unwrap().get(JOB_NAME_KEY).map(String::as_str),
        Some("disk-alert")
    );
}

#[tokio::test]
async fn test_render_is_repeatable() {
    let h = harness().await;
    h.templates
        .create(&NewTemplate::new(
            "report",
            "{{#if host}}[{{host}}] {{/if}}Nightly report",
            "{{ status | default:\"ok\" | title }}",
        ))
        .await
        .unwrap();

    let mut vars = Metadata::new();
    vars.insert("host".into(), "db-1".into());

    let first = h.templates.render("report", &vars).await.unwrap();
    let second = h.templates.render("report", &vars).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.title, "[db-1] Nightly report");
    assert_eq!(first.body, "Ok");
}

#[tokio::test]
async fn test_invalid_jobs_rejected() {
    let h = harness().await;

    let err = h
        .scheduler
        .add(NewScheduledJob::new("bad-cron", "61 * * * *", services()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCron { .. }));

    let err = h
        .scheduler
        .add(NewScheduledJob::new("no-services", "* * * * *", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .scheduler
        .add(NewScheduledJob::new("missing-template", "* * * * *", services()).with_template("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound(_)));

    h.scheduler
        .add(NewScheduledJob::new("dup", "* * * * *", services()))
        .await
        .unwrap();
    let err = h
        .scheduler
        .add(NewScheduledJob::new("dup", "@daily", services()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(h.scheduler.registered(), 1);
}
