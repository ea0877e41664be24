// src/utils/prometheus_metrics.rs

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

// Metrics from the Store
pub static DOCUMENTS_INSERTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_documents_inserted_total",
        "Total number of documents inserted into the active set."
    )
    .expect("Failed to register DOCUMENTS_INSERTED_TOTAL counter")
});

pub static CLAIMS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("store_claims_total", "Total number of successful claims.")
        .expect("Failed to register CLAIMS_TOTAL counter")
});

pub static CLAIM_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_claim_misses_total",
        "Total number of claims that found no document."
    )
    .expect("Failed to register CLAIM_MISSES_TOTAL counter")
});

pub static CLAIM_CONFLICTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_claim_conflicts_total",
        "Total number of claim races lost to a concurrent caller."
    )
    .expect("Failed to register CLAIM_CONFLICTS_TOTAL counter")
});

pub static LEASES_EXPIRED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_leases_expired_total",
        "Total number of documents reclaimed after their claim lease expired."
    )
    .expect("Failed to register LEASES_EXPIRED_TOTAL counter")
});

pub static CLAIMS_REJECTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_claims_rejected_total",
        "Total number of releases, commits and marks refused for a stale or missing claim."
    )
    .expect("Failed to register CLAIMS_REJECTED_TOTAL counter")
});

pub static CLAIMS_REISSUED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_claims_reissued_total",
        "Total number of recurring claims handed out again after their interval."
    )
    .expect("Failed to register CLAIMS_REISSUED_TOTAL counter")
});

pub static PARTIAL_WRITES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_partial_writes_total",
        "Total number of partial write-backs under an open claim."
    )
    .expect("Failed to register PARTIAL_WRITES_TOTAL counter")
});

pub static RELEASES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("store_releases_total", "Total number of released claims.")
        .expect("Failed to register RELEASES_TOTAL counter")
});

pub static COMMITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("store_commits_total", "Total number of committed documents.")
        .expect("Failed to register COMMITS_TOTAL counter")
});

pub static DISCARDS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("store_discards_total", "Total number of discarded documents.")
        .expect("Failed to register DISCARDS_TOTAL counter")
});

pub static FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_failures_total",
        "Total number of documents marked as failed."
    )
    .expect("Failed to register FAILURES_TOTAL counter")
});

pub static ARCHIVED_DOCUMENTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_archived_documents_total",
        "Total number of documents moved to the archive by rollover."
    )
    .expect("Failed to register ARCHIVED_DOCUMENTS_TOTAL counter")
});

pub static EVICTED_DOCUMENTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "store_evicted_documents_total",
        "Total number of archived documents evicted to keep the archive bounded."
    )
    .expect("Failed to register EVICTED_DOCUMENTS_TOTAL counter")
});

pub static ACTIVE_DOCUMENTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("store_active_documents", "Documents in the active set.")
        .expect("Failed to register ACTIVE_DOCUMENTS gauge")
});

pub static ARCHIVED_DOCUMENTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("store_archived_documents", "Documents in the archive.")
        .expect("Failed to register ARCHIVED_DOCUMENTS gauge")
});

pub static ARCHIVE_BYTES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("store_archive_bytes", "Serialized size of the archive in bytes.")
        .expect("Failed to register ARCHIVE_BYTES gauge")
});

pub static CLAIM_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "store_claim_duration_seconds",
        "Histogram of claim_and_tag latencies, hits and misses alike."
    )
    .expect("Failed to register CLAIM_DURATION_SECONDS histogram")
});

// Metrics from the protocol server
pub static HTTP_REQUESTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "server_requests_total",
        "Total number of coordination protocol requests handled."
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL counter")
});

pub static HTTP_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "server_errors_total",
        "Total number of coordination protocol requests answered with an error."
    )
    .expect("Failed to register HTTP_ERRORS_TOTAL counter")
});

// Metrics from Worker
pub static WORKER_DOCUMENTS_PROCESSED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_documents_processed_total",
        "Total number of documents committed by the worker."
    )
    .expect("Failed to register WORKER_DOCUMENTS_PROCESSED_TOTAL counter")
});

pub static WORKER_DOCUMENTS_DISCARDED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_documents_discarded_total",
        "Total number of documents discarded by the worker's steps."
    )
    .expect("Failed to register WORKER_DOCUMENTS_DISCARDED_TOTAL counter")
});

pub static WORKER_DOCUMENTS_RELEASED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_documents_released_total",
        "Total number of documents released after a processing error."
    )
    .expect("Failed to register WORKER_DOCUMENTS_RELEASED_TOTAL counter")
});

pub static WORKER_DOCUMENTS_LOST_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_documents_lost_total",
        "Total number of results dropped because the claim was no longer held."
    )
    .expect("Failed to register WORKER_DOCUMENTS_LOST_TOTAL counter")
});

pub static WORKER_EMPTY_POLLS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_empty_polls_total",
        "Total number of claims that returned no document."
    )
    .expect("Failed to register WORKER_EMPTY_POLLS_TOTAL counter")
});

pub static WORKER_PROTOCOL_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "worker_protocol_retries_total",
        "Total number of protocol calls retried after a transient failure."
    )
    .expect("Failed to register WORKER_PROTOCOL_RETRIES_TOTAL counter")
});

pub static WORKER_PROCESSING_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "worker_processing_duration_seconds",
        "Histogram of document processing durations (from claim to commit/release)."
    )
    .expect("Failed to register WORKER_PROCESSING_DURATION_SECONDS histogram")
});

// Metrics from the Supervisor
pub static SUPERVISOR_WORKER_STARTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "supervisor_worker_starts_total",
        "Total number of stage worker launches, restarts included."
    )
    .expect("Failed to register SUPERVISOR_WORKER_STARTS_TOTAL counter")
});

pub static SUPERVISOR_WORKER_CRASHES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "supervisor_worker_crashes_total",
        "Total number of stage worker crashes observed."
    )
    .expect("Failed to register SUPERVISOR_WORKER_CRASHES_TOTAL counter")
});

pub static SUPERVISOR_RECONCILES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "supervisor_reconciles_total",
        "Total number of pipeline reconciliations."
    )
    .expect("Failed to register SUPERVISOR_RECONCILES_TOTAL counter")
});

pub static SUPERVISOR_RUNNING_STAGES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "supervisor_running_stages",
        "Number of stages with a supervised worker."
    )
    .expect("Failed to register SUPERVISOR_RUNNING_STAGES gauge")
});

// Metrics from Producer
pub static PRODUCER_DOCUMENTS_INSERTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "producer_documents_inserted_total",
        "Total number of documents inserted by the producer."
    )
    .expect("Failed to register PRODUCER_DOCUMENTS_INSERTED_TOTAL counter")
});

pub static PRODUCER_INSERT_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "producer_insert_errors_total",
        "Total number of documents the producer failed to parse or insert."
    )
    .expect("Failed to register PRODUCER_INSERT_ERRORS_TOTAL counter")
});
