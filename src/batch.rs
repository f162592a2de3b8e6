//! # Batch Scheduler
//!
//! Executes many operations in one request, sequentially or in parallel
//! under a counted-semaphore concurrency bound. Outcomes are indexed by the
//! caller-supplied ordinal, never by completion order. Cancellation
//! propagates through a shared watch channel; in-flight operations observe
//! it and terminate, already-completed operations keep their outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsService;
use crate::config::BatchConfig;
use crate::engine::ExecutionEngine;
use crate::error::{ErrorKind, ServiceError};
use crate::types::{
    BatchOperation, BatchOperationBody, BatchOperationResult, BatchRequest, BatchResponse,
    BatchStats, BatchStatus, OperationStatus,
};
use crate::validation;

/// Stored record of one batch job
#[derive(Debug, Clone)]
pub struct BatchJobRecord {
    pub id: String,
    pub status: BatchStatus,
    pub results: Vec<Option<BatchOperationResult>>,
    pub operation_ids: Vec<i32>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub total_time_ms: Option<i64>,
}

impl BatchJobRecord {
    fn operation_statuses(&self) -> Vec<OperationStatus> {
        self.results
            .iter()
            .map(|slot| match slot {
                None => {
                    if self.status == BatchStatus::Running {
                        OperationStatus::Pending
                    } else {
                        OperationStatus::Failed
                    }
                }
                Some(result) if result.success => OperationStatus::Completed,
                Some(_) => OperationStatus::Failed,
            })
            .collect()
    }
}

pub struct BatchService {
    engine: Arc<ExecutionEngine>,
    analytics: Arc<AnalyticsService>,
    config: BatchConfig,
    jobs: Arc<RwLock<HashMap<String, Arc<Mutex<BatchJobRecord>>>>>,
    cancel_signals: Arc<RwLock<HashMap<String, watch::Sender<bool>>>>,
}

impl BatchService {
    pub fn new(engine: Arc<ExecutionEngine>, analytics: Arc<AnalyticsService>, config: BatchConfig) -> Self {
        Self {
            engine,
            analytics,
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            cancel_signals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Runs a batch to completion and returns the per-operation outcomes.
    /// The job record stays queryable by id afterwards.
    pub async fn execute_batch(
        &self,
        req: &BatchRequest,
        user_id: &str,
        request_id: &str,
    ) -> Result<BatchResponse, ServiceError> {
        validation::validate_batch_request(req, self.config.max_batch_size)?;

        let started = Instant::now();
        let job_id = Uuid::new_v4().to_string();
        let options = req.options.clone().unwrap_or_default();
        let total = req.operations.len();

        info!(
            job_id = %job_id,
            operation_count = %total,
            parallel = %options.parallel,
            stop_on_error = %options.stop_on_error,
            "Starting batch job"
        );

        let record = Arc::new(Mutex::new(BatchJobRecord {
            id: job_id.clone(),
            status: BatchStatus::Running,
            results: vec![None; total],
            operation_ids: req.operations.iter().map(|op| op.id).collect(),
            created_at: Utc::now().timestamp(),
            completed_at: None,
            total_time_ms: None,
        }));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.jobs.write().await.insert(job_id.clone(), record.clone());
        self.cancel_signals.write().await.insert(job_id.clone(), cancel_tx);

        if options.parallel {
            let max_concurrency = options
                .max_concurrency
                .map(|c| c as usize)
                .unwrap_or(self.config.max_concurrency)
                .max(1);
            self.run_parallel(req, &record, cancel_rx, max_concurrency, options.stop_on_error, user_id, request_id)
                .await;
        } else {
            self.run_sequential(req, &record, cancel_rx, options.stop_on_error, user_id, request_id)
                .await;
        }

        let cancelled = {
            let signals = self.cancel_signals.read().await;
            signals.get(&job_id).map(|tx| *tx.borrow()).unwrap_or(false)
        };

        let response = {
            let mut record = record.lock().await;
            record.status = if cancelled { BatchStatus::Cancelled } else { BatchStatus::Completed };
            record.completed_at = Some(Utc::now().timestamp());
            record.total_time_ms = Some(started.elapsed().as_millis() as i64);
            self.build_response(&record)
        };

        self.cancel_signals.write().await.remove(&job_id);

        info!(
            job_id = %job_id,
            total = %response.total,
            successful = %response.successful,
            failed = %response.failed,
            total_time_ms = %response.total_time_ms,
            "Batch job finished"
        );

        Ok(response)
    }

    async fn run_sequential(
        &self,
        req: &BatchRequest,
        record: &Arc<Mutex<BatchJobRecord>>,
        cancel_rx: watch::Receiver<bool>,
        stop_on_error: bool,
        user_id: &str,
        request_id: &str,
    ) {
        let mut stopped = false;

        for (index, operation) in req.operations.iter().enumerate() {
            if stopped || *cancel_rx.borrow() {
                let error = if *cancel_rx.borrow() {
                    ServiceError::new(ErrorKind::Internal, "CANCELLED", "batch was cancelled")
                } else {
                    ServiceError::new(
                        ErrorKind::Internal,
                        "OPERATION_NOT_EXECUTED",
                        "operation skipped after earlier failure",
                    )
                };
                record.lock().await.results[index] = Some(BatchOperationResult {
                    operation_id: operation.id,
                    success: false,
                    data: None,
                    error: Some(error.to_detail()),
                    execution_time_ms: 0,
                });
                continue;
            }

            let result = self
                .run_operation(operation, cancel_rx.clone(), user_id, request_id)
                .await;
            let failed = !result.success;
            record.lock().await.results[index] = Some(result);

            if stop_on_error && failed {
                stopped = true;
            }
        }
    }

    async fn run_parallel(
        &self,
        req: &BatchRequest,
        record: &Arc<Mutex<BatchJobRecord>>,
        cancel_rx: watch::Receiver<bool>,
        max_concurrency: usize,
        stop_on_error: bool,
        user_id: &str,
        request_id: &str,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let stop_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handles = Vec::with_capacity(req.operations.len());

        for (index, operation) in req.operations.iter().enumerate() {
            let semaphore = semaphore.clone();
            let stop_flag = stop_flag.clone();
            let cancel_rx = cancel_rx.clone();
            let record = record.clone();
            let operation = operation.clone();
            let engine = self.engine.clone();
            let analytics = self.analytics.clone();
            let user_id = user_id.to_string();
            let request_id = request_id.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                // Stop admitting new operations after a failure under
                // stop_on_error; operations already past this gate finish.
                if stop_flag.load(std::sync::atomic::Ordering::Acquire) {
                    record.lock().await.results[index] = Some(BatchOperationResult {
                        operation_id: operation.id,
                        success: false,
                        data: None,
                        error: Some(
                            ServiceError::new(
                                ErrorKind::Internal,
                                "OPERATION_NOT_EXECUTED",
                                "operation skipped after earlier failure",
                            )
                            .to_detail(),
                        ),
                        execution_time_ms: 0,
                    });
                    return;
                }

                let result =
                    run_operation_inner(&engine, &analytics, &operation, cancel_rx, &user_id, &request_id)
                        .await;
                if !result.success && stop_on_error {
                    stop_flag.store(true, std::sync::atomic::Ordering::Release);
                }
                record.lock().await.results[index] = Some(result);
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Batch operation task panicked");
            }
        }
    }

    async fn run_operation(
        &self,
        operation: &BatchOperation,
        cancel_rx: watch::Receiver<bool>,
        user_id: &str,
        request_id: &str,
    ) -> BatchOperationResult {
        run_operation_inner(&self.engine, &self.analytics, operation, cancel_rx, user_id, request_id).await
    }

    fn build_response(&self, record: &BatchJobRecord) -> BatchResponse {
        let results: Vec<BatchOperationResult> = record
            .results
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.clone().unwrap_or_else(|| BatchOperationResult {
                    operation_id: record.operation_ids[index],
                    success: false,
                    data: None,
                    error: Some(
                        ServiceError::new(
                            ErrorKind::Internal,
                            "OPERATION_NOT_EXECUTED",
                            "operation was never executed",
                        )
                        .to_detail(),
                    ),
                    execution_time_ms: 0,
                })
            })
            .collect();

        let total = results.len() as i32;
        let successful = results.iter().filter(|r| r.success).count() as i32;

        BatchResponse {
            batch_id: record.id.clone(),
            status: record.status,
            results,
            total,
            successful,
            failed: total - successful,
            total_time_ms: record.total_time_ms.unwrap_or(0),
            response_metadata: None,
        }
    }

    /// Current state of a job, as a response snapshot
    pub async fn get_batch_status(&self, job_id: &str) -> Option<BatchResponse> {
        let record = self.jobs.read().await.get(job_id).cloned()?;
        let record = record.lock().await;
        Some(self.build_response(&record))
    }

    /// Per-operation statuses for a job
    pub async fn get_operation_statuses(&self, job_id: &str) -> Option<Vec<OperationStatus>> {
        let record = self.jobs.read().await.get(job_id).cloned()?;
        let record = record.lock().await;
        Some(record.operation_statuses())
    }

    /// Signals cancellation. In-flight operations terminate with CANCELLED;
    /// completed operations retain their outcomes.
    pub async fn cancel_batch(&self, job_id: &str) -> Result<BatchResponse, ServiceError> {
        let record = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("batch job '{}' not found", job_id)))?;

        if let Some(cancel_tx) = self.cancel_signals.read().await.get(job_id) {
            let _ = cancel_tx.send(true);
            debug!(job_id = %job_id, "Batch cancellation signalled");
        }

        let mut record = record.lock().await;
        if record.status == BatchStatus::Running {
            record.status = BatchStatus::Cancelled;
        }
        info!(job_id = %job_id, "Batch job cancelled");
        Ok(self.build_response(&record))
    }

    /// Aggregate counters over every job seen by this node
    pub async fn stats(&self) -> BatchStats {
        let jobs = self.jobs.read().await;
        let mut stats = BatchStats::default();

        for record in jobs.values() {
            let record = record.lock().await;
            stats.total_jobs += 1;
            match record.status {
                BatchStatus::Running | BatchStatus::Pending => stats.running_jobs += 1,
                BatchStatus::Completed => stats.completed_jobs += 1,
                BatchStatus::Cancelled => stats.cancelled_jobs += 1,
                BatchStatus::Failed => stats.failed_jobs += 1,
            }
            for slot in &record.results {
                stats.total_operations += 1;
                match slot {
                    Some(result) if result.success => stats.successful_operations += 1,
                    Some(_) => stats.failed_operations += 1,
                    None => {}
                }
            }
        }

        stats
    }
}

async fn run_operation_inner(
    engine: &ExecutionEngine,
    analytics: &AnalyticsService,
    operation: &BatchOperation,
    mut cancel_rx: watch::Receiver<bool>,
    user_id: &str,
    request_id: &str,
) -> BatchOperationResult {
    let started = Instant::now();

    if *cancel_rx.borrow() {
        return cancelled_result(operation.id);
    }

    let outcome = tokio::select! {
        result = execute_operation_body(engine, analytics, &operation.body, user_id, request_id) => result,
        _ = cancel_rx.changed() => {
            return cancelled_result(operation.id);
        }
    };

    let execution_time_ms = started.elapsed().as_millis() as i32;

    match outcome {
        Ok(data) => BatchOperationResult {
            operation_id: operation.id,
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
        },
        Err(err) => {
            debug!(operation_id = %operation.id, error = %err, "Batch operation failed");
            BatchOperationResult {
                operation_id: operation.id,
                success: false,
                data: None,
                error: Some(err.to_detail()),
                execution_time_ms,
            }
        }
    }
}

async fn execute_operation_body(
    engine: &ExecutionEngine,
    analytics: &AnalyticsService,
    body: &BatchOperationBody,
    user_id: &str,
    request_id: &str,
) -> Result<serde_json::Value, ServiceError> {
    match body {
        BatchOperationBody::ExecuteTemplate(req) => {
            validation::validate_execute_request(req)?;
            let response = engine.execute(req, user_id, request_id).await?;
            Ok(serde_json::to_value(response)?)
        }
        BatchOperationBody::LogEvent(req) => {
            validation::validate_analytics_event(req)?;
            let event = analytics
                .log_event(user_id, req.clone(), Some(request_id.to_string()), None)
                .await;
            Ok(serde_json::to_value(event)?)
        }
    }
}

fn cancelled_result(operation_id: i32) -> BatchOperationResult {
    BatchOperationResult {
        operation_id,
        success: false,
        data: None,
        error: Some(
            ServiceError::new(ErrorKind::Internal, "CANCELLED", "batch was cancelled").to_detail(),
        ),
        execution_time_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::{register_builtin_domains, DomainRegistry};
    use crate::types::ExecuteTemplateRequest;
    use crate::webhook::WebhookService;

    async fn batch_service() -> BatchService {
        let config = Config::default();
        let registry = DomainRegistry::new();
        register_builtin_domains(&registry).await;
        let analytics = Arc::new(AnalyticsService::new());
        let webhooks = Arc::new(WebhookService::new(config.webhook.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            registry,
            config.engine.clone(),
            analytics.clone(),
            webhooks,
        ));
        BatchService::new(engine, analytics, config.batch)
    }

    fn execute_op(id: i32, query: &str) -> BatchOperation {
        BatchOperation {
            id,
            body: BatchOperationBody::ExecuteTemplate(ExecuteTemplateRequest {
                query: query.to_string(),
                language: "ru".to_string(),
                context: None,
                options: None,
                filters: None,
                metadata: None,
            }),
        }
    }

    fn batch(operations: Vec<BatchOperation>, options: Option<crate::types::BatchOptions>) -> BatchRequest {
        BatchRequest { operations, options, metadata: None }
    }

    #[tokio::test]
    async fn test_sequential_batch_all_succeed() {
        let service = batch_service().await;
        let req = batch(vec![execute_op(1, "купить ноутбук"), execute_op(2, "рецепт борща")], None);

        let response = service.execute_batch(&req, "user-1", "req-1").await.unwrap();

        assert_eq!(response.total, 2);
        assert_eq!(response.successful, 2);
        assert_eq!(response.failed, 0);
        assert_eq!(response.status, BatchStatus::Completed);
        // Outcomes appear at the caller-supplied ordinal
        assert_eq!(response.results[0].operation_id, 1);
        assert_eq!(response.results[1].operation_id, 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_with_one_invalid_operation() {
        let service = batch_service().await;
        let req = batch(
            vec![execute_op(1, "купить ноутбук"), execute_op(2, "")],
            Some(crate::types::BatchOptions { parallel: true, ..Default::default() }),
        );

        let response = service.execute_batch(&req, "user-1", "req-2").await.unwrap();

        assert_eq!(response.total, 2);
        assert_eq!(response.successful, 1);
        assert_eq!(response.failed, 1);

        let failed = response.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.operation_id, 2);
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.error_type, ErrorKind::Validation);

        let succeeded = response.results.iter().find(|r| r.success).unwrap();
        assert!(succeeded.data.as_ref().unwrap().get("execution_id").is_some());
    }

    #[tokio::test]
    async fn test_sequential_stop_on_error_skips_remainder() {
        let service = batch_service().await;
        let req = batch(
            vec![
                execute_op(10, ""),
                execute_op(20, "купить ноутбук"),
                execute_op(30, "рецепт борща"),
            ],
            Some(crate::types::BatchOptions { stop_on_error: true, ..Default::default() }),
        );

        let response = service.execute_batch(&req, "user-1", "req-3").await.unwrap();

        assert_eq!(response.total, 3);
        assert_eq!(response.successful, 0);
        assert_eq!(response.failed, 3);
        assert_eq!(
            response.results[1].error.as_ref().unwrap().code,
            "OPERATION_NOT_EXECUTED"
        );
        assert_eq!(
            response.results[2].error.as_ref().unwrap().code,
            "OPERATION_NOT_EXECUTED"
        );
    }

    #[tokio::test]
    async fn test_batch_size_limit_enforced() {
        let service = batch_service().await;
        let operations: Vec<BatchOperation> =
            (0..101).map(|i| execute_op(i, "купить ноутбук")).collect();
        let req = batch(operations, None);

        let err = service.execute_batch(&req, "user-1", "req-4").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_log_event_operation() {
        let service = batch_service().await;
        let req = batch(
            vec![BatchOperation {
                id: 1,
                body: BatchOperationBody::LogEvent(crate::types::AnalyticsEventRequest {
                    event_type: "user.action".to_string(),
                    event_data: HashMap::new(),
                    session_id: None,
                    metadata: None,
                }),
            }],
            None,
        );

        let response = service.execute_batch(&req, "user-1", "req-5").await.unwrap();
        assert_eq!(response.successful, 1);
    }

    #[tokio::test]
    async fn test_status_queryable_after_completion() {
        let service = batch_service().await;
        let req = batch(vec![execute_op(1, "купить ноутбук")], None);

        let response = service.execute_batch(&req, "user-1", "req-6").await.unwrap();
        let status = service.get_batch_status(&response.batch_id).await.unwrap();
        assert_eq!(status.batch_id, response.batch_id);
        assert_eq!(status.successful, 1);

        assert!(service.get_batch_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_batch_is_not_found() {
        let service = batch_service().await;
        let err = service.cancel_batch("no-such-job").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_totals_invariant_holds_across_modes() {
        let service = batch_service().await;
        for parallel in [false, true] {
            let req = batch(
                vec![
                    execute_op(1, "купить ноутбук"),
                    execute_op(2, ""),
                    execute_op(3, "рецепт борща"),
                ],
                Some(crate::types::BatchOptions { parallel, ..Default::default() }),
            );
            let response = service.execute_batch(&req, "user-1", "req-7").await.unwrap();
            assert_eq!(response.successful + response.failed, response.total);
        }
    }

    #[tokio::test]
    async fn test_cancelled_signal_yields_cancelled_outcome() {
        let service = batch_service().await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = run_operation_inner(
            &service.engine,
            &service.analytics,
            &execute_op(7, "купить ноутбук"),
            rx,
            "user-1",
            "req-cancel",
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().code, "CANCELLED");
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_outcomes() {
        let service = batch_service().await;
        let req = batch(vec![execute_op(1, "купить ноутбук")], None);
        let response = service.execute_batch(&req, "user-1", "req-9").await.unwrap();

        let cancelled = service.cancel_batch(&response.batch_id).await.unwrap();
        // Completed operations retain their outcomes; the job does not
        // regress to cancelled
        assert_eq!(cancelled.status, BatchStatus::Completed);
        assert_eq!(cancelled.successful, 1);
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let service = batch_service().await;
        let req = batch(vec![execute_op(1, "купить ноутбук"), execute_op(2, "")], None);
        service.execute_batch(&req, "user-1", "req-8").await.unwrap();

        let stats = service.stats().await;
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.successful_operations, 1);
        assert_eq!(stats.failed_operations, 1);
    }
}
