//! # Execution Engine
//!
//! Fans a validated execute request out to the classifier-selected domains,
//! collects per-domain outcomes under child deadlines, ranks the merged
//! results and assembles the execution record. A single domain failure or
//! timeout never aborts its peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsService;
use crate::classifier;
use crate::config::EngineConfig;
use crate::error::ServiceError;
use crate::registry::{DomainOutput, DomainRegistry};
use crate::types::{
    DomainSection, ExecuteTemplateRequest, ExecuteTemplateResponse, ExecutionMetadata,
    ExecutionStatus, QueryType, RankedItem, RankingResult, ResultItem, SectionStatus, Workflow,
    WorkflowStep, WorkflowStepStatus,
};
use crate::webhook::WebhookService;

/// Ranking algorithm name surfaced on every ranking result
pub const RANKING_ALGORITHM: &str = "weighted_relevance_confidence";

const PURCHASE_LEMMAS: &[&str] = &["купить", "заказать", "приобрести", "buy", "order", "purchase"];
const INFORMATIONAL_LEMMAS: &[&str] = &["рецепт", "как", "инструкция", "справка", "что такое"];

/// Outcome of one domain invocation before section assembly
struct DomainOutcome {
    domain_id: String,
    title: String,
    output: DomainOutput,
    elapsed_ms: i32,
    error: Option<ServiceError>,
    timed_out: bool,
}

/// The execution engine. Holds the registry snapshot source, the ranking
/// weights and the execution store used for status polling.
pub struct ExecutionEngine {
    registry: DomainRegistry,
    config: EngineConfig,
    analytics: Arc<AnalyticsService>,
    webhooks: Arc<WebhookService>,
    executions: Arc<RwLock<HashMap<String, ExecuteTemplateResponse>>>,
}

impl ExecutionEngine {
    pub fn new(
        registry: DomainRegistry,
        config: EngineConfig,
        analytics: Arc<AnalyticsService>,
        webhooks: Arc<WebhookService>,
    ) -> Self {
        Self {
            registry,
            config,
            analytics,
            webhooks,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Executes a validated template request end to end and returns the
    /// execution record. The record is retained for status polling.
    pub async fn execute(
        &self,
        req: &ExecuteTemplateRequest,
        user_id: &str,
        request_id: &str,
    ) -> Result<ExecuteTemplateResponse, ServiceError> {
        let started = Instant::now();
        let started_at = Utc::now().timestamp();

        let execution_id = Uuid::new_v4().to_string();
        let intent_id = Uuid::new_v4().to_string();

        info!(
            execution_id = %execution_id,
            query = %req.query,
            language = %req.language,
            "Executing template"
        );

        // 1-2. Classify intent against the current registry snapshot
        let profiles = self.registry.profiles().await;
        let classification = classifier::classify(
            &req.query,
            &profiles,
            req.filters.as_ref(),
            &self.config.fallback_domain,
        );

        if classification.domains.is_empty() {
            return Err(ServiceError::validation(
                "no domains available for this query after filtering",
            ));
        }

        // 3-4. Fan out under child deadlines
        let parallel = req.options.as_ref().map(|o| o.parallel_execution).unwrap_or(false);
        let outcomes = if parallel {
            self.run_parallel(req, &classification.domains).await
        } else {
            self.run_sequential(req, &classification.domains).await
        };

        // 5-6. Assemble sections and rank across domains
        let min_relevance = req
            .filters
            .as_ref()
            .and_then(|f| f.min_relevance)
            .unwrap_or(0.0);
        let max_per_domain = req
            .options
            .as_ref()
            .and_then(|o| o.max_results_per_domain)
            .unwrap_or(0);

        let mut sections = Vec::with_capacity(outcomes.len());
        let mut workflow: Option<Workflow> = None;

        for outcome in &outcomes {
            let status = if outcome.timed_out {
                SectionStatus::Timeout
            } else if outcome.error.is_some() {
                SectionStatus::Error
            } else {
                SectionStatus::Success
            };

            let mut results: Vec<ResultItem> = outcome
                .output
                .results
                .iter()
                .cloned()
                .map(clamp_scores)
                .filter(|item| item.relevance >= min_relevance)
                .collect();

            results.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if max_per_domain > 0 {
                results.truncate(max_per_domain as usize);
            }

            if workflow.is_none() {
                if let Some(plan) = &outcome.output.workflow {
                    validate_workflow_dag(plan)?;
                    workflow = Some(plan.clone());
                }
            }

            sections.push(DomainSection {
                domain_id: outcome.domain_id.clone(),
                title: outcome.title.clone(),
                status,
                error: outcome.error.as_ref().map(|e| e.message.clone()),
                response_time_ms: outcome.elapsed_ms,
                results,
            });
        }

        let ranking = self.rank(&sections);

        // 7-8. Overall status and query type
        let status = derive_overall_status(&sections);
        let query_type = derive_query_type(&req.query);

        let completed_at = Utc::now().timestamp();
        let processing_time_ms = started.elapsed().as_millis() as i32;
        let results_count: i32 = sections.iter().map(|s| s.results.len() as i32).sum();

        let response = ExecuteTemplateResponse {
            execution_id: execution_id.clone(),
            intent_id,
            status,
            query_type: Some(query_type),
            sections,
            ranking,
            workflow,
            domain_analysis: Some(classification.analysis),
            metadata: Some(ExecutionMetadata {
                started_at,
                completed_at,
                total_time_ms: started.elapsed().as_millis() as i64,
                domains_executed: outcomes.len() as i32,
                results_count,
            }),
            processing_time_ms,
            response_metadata: None,
            pagination: None,
        };

        // 10. Retain for polling, then emit analytics and webhooks off the
        // request path
        self.executions
            .write()
            .await
            .insert(execution_id.clone(), response.clone());

        self.analytics
            .log_template_execution(user_id, request_id, req, &response)
            .await;

        let event_type = match status {
            ExecutionStatus::Failed | ExecutionStatus::Timeout => "template.failed",
            _ => "template.completed",
        };
        self.webhooks
            .fire_event(
                event_type,
                json!({
                    "execution_id": execution_id,
                    "status": status,
                    "query_type": query_type,
                    "processing_time_ms": processing_time_ms,
                }),
                Some(user_id.to_string()),
                Some(request_id.to_string()),
            )
            .await;

        Ok(response)
    }

    /// Looks up a retained execution record by id
    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecuteTemplateResponse> {
        self.executions.read().await.get(execution_id).cloned()
    }

    async fn run_parallel(
        &self,
        req: &ExecuteTemplateRequest,
        domains: &[String],
    ) -> Vec<DomainOutcome> {
        let mut handles = Vec::with_capacity(domains.len());

        for domain_id in domains {
            let registry = self.registry.clone();
            let req = req.clone();
            let domain_id = domain_id.clone();
            let deadline = self.child_deadline(&req, &domain_id).await;

            handles.push(tokio::spawn(async move {
                invoke_domain(&registry, &domain_id, &req, deadline).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (handle, domain_id) in handles.into_iter().zip(domains) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    error!(domain = %domain_id, error = %join_err, "Domain task panicked");
                    outcomes.push(DomainOutcome {
                        domain_id: domain_id.clone(),
                        title: domain_id.clone(),
                        output: DomainOutput::default(),
                        elapsed_ms: 0,
                        error: Some(ServiceError::internal("domain task panicked")),
                        timed_out: false,
                    });
                }
            }
        }

        // Sections keep classifier order regardless of completion order
        outcomes
    }

    async fn run_sequential(
        &self,
        req: &ExecuteTemplateRequest,
        domains: &[String],
    ) -> Vec<DomainOutcome> {
        let mut outcomes = Vec::with_capacity(domains.len());
        for domain_id in domains {
            let deadline = self.child_deadline(req, domain_id).await;
            outcomes.push(invoke_domain(&self.registry, domain_id, req, deadline).await);
        }
        outcomes
    }

    /// Child deadline: min(options.timeout_ms, domain timeout, engine default)
    async fn child_deadline(&self, req: &ExecuteTemplateRequest, domain_id: &str) -> Duration {
        let request_ms = req
            .options
            .as_ref()
            .and_then(|o| o.timeout_ms)
            .filter(|&ms| ms > 0)
            .map(|ms| ms as u64)
            .unwrap_or(self.config.default_timeout_ms);

        let domain_ms = match self.registry.get(domain_id).await {
            Some(executor) => executor.timeout_ms(),
            None => self.config.default_timeout_ms,
        };

        Duration::from_millis(request_ms.min(domain_ms).min(self.config.max_timeout_ms))
    }

    /// Cross-domain ranking: weighted relevance/confidence, descending, with
    /// 1-based ranks
    fn rank(&self, sections: &[DomainSection]) -> Option<RankingResult> {
        let w_relevance = self.config.ranking_relevance_weight;
        let w_confidence = self.config.ranking_confidence_weight;

        let mut scored: Vec<(String, f32)> = sections
            .iter()
            .flat_map(|section| section.results.iter())
            .map(|item| {
                (
                    item.id.clone(),
                    item.relevance * w_relevance + item.confidence * w_confidence,
                )
            })
            .collect();

        if scored.is_empty() {
            return None;
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let items = scored
            .into_iter()
            .enumerate()
            .map(|(i, (id, score))| RankedItem { id, score, rank: (i + 1) as i32 })
            .collect();

        Some(RankingResult { items, algorithm: RANKING_ALGORITHM.to_string() })
    }
}

async fn invoke_domain(
    registry: &DomainRegistry,
    domain_id: &str,
    req: &ExecuteTemplateRequest,
    deadline: Duration,
) -> DomainOutcome {
    let started = Instant::now();

    let Some(executor) = registry.get(domain_id).await else {
        return DomainOutcome {
            domain_id: domain_id.to_string(),
            title: domain_id.to_string(),
            output: DomainOutput::default(),
            elapsed_ms: 0,
            error: Some(ServiceError::external(format!(
                "no live handler for domain '{}'",
                domain_id
            ))),
            timed_out: false,
        };
    };

    let title = executor.title().to_string();
    let invocation = executor.invoke(&req.query, req.context.as_ref(), req.options.as_ref());

    match tokio::time::timeout(deadline, invocation).await {
        Ok(Ok(output)) => DomainOutcome {
            domain_id: domain_id.to_string(),
            title,
            output,
            elapsed_ms: started.elapsed().as_millis() as i32,
            error: None,
            timed_out: false,
        },
        Ok(Err(err)) => {
            warn!(domain = %domain_id, error = %err, "Domain execution failed");
            DomainOutcome {
                domain_id: domain_id.to_string(),
                title,
                output: DomainOutput::default(),
                elapsed_ms: started.elapsed().as_millis() as i32,
                error: Some(err),
                timed_out: false,
            }
        }
        Err(_) => {
            warn!(domain = %domain_id, deadline_ms = %deadline.as_millis(), "Domain execution timed out");
            DomainOutcome {
                domain_id: domain_id.to_string(),
                title,
                output: DomainOutput::default(),
                elapsed_ms: started.elapsed().as_millis() as i32,
                error: Some(ServiceError::external(format!(
                    "domain '{}' timed out after {} ms",
                    domain_id,
                    deadline.as_millis()
                ))),
                timed_out: true,
            }
        }
    }
}

fn clamp_scores(mut item: ResultItem) -> ResultItem {
    item.relevance = item.relevance.clamp(0.0, 1.0);
    item.confidence = item.confidence.clamp(0.0, 1.0);
    item
}

/// Overall status: completed when every section succeeded, failed when none
/// did, timeout only when every section timed out, partial otherwise.
fn derive_overall_status(sections: &[DomainSection]) -> ExecutionStatus {
    if sections.is_empty() {
        return ExecutionStatus::Failed;
    }

    let successes = sections.iter().filter(|s| s.status == SectionStatus::Success).count();
    let timeouts = sections.iter().filter(|s| s.status == SectionStatus::Timeout).count();

    if successes == sections.len() {
        ExecutionStatus::Completed
    } else if timeouts == sections.len() {
        ExecutionStatus::Timeout
    } else if successes == 0 {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Partial
    }
}

/// Purchase lemmas win over co-occurring informational lemmas
fn derive_query_type(query: &str) -> QueryType {
    let query = query.to_lowercase();
    let has_purchase = PURCHASE_LEMMAS.iter().any(|kw| query.contains(kw));
    let has_informational = INFORMATIONAL_LEMMAS.iter().any(|kw| query.contains(kw));

    match (has_purchase, has_informational) {
        (true, _) => QueryType::WithPurchasesServices,
        (false, true) => QueryType::InformationOnly,
        (false, false) => QueryType::Mixed,
    }
}

/// Checks that `depends_on` references form a DAG over the steps'
/// result ids. Steps may only depend on results produced by other steps.
pub fn validate_workflow_dag(workflow: &Workflow) -> Result<(), ServiceError> {
    let ids: std::collections::HashSet<&str> = workflow
        .steps
        .iter()
        .filter_map(|s| s.result_id.as_deref())
        .collect();

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ServiceError::internal(format!(
                    "workflow step {} depends on unknown result '{}'",
                    step.step, dep
                )));
            }
            if step.result_id.as_deref() == Some(dep.as_str()) {
                return Err(ServiceError::internal(format!(
                    "workflow step {} depends on itself",
                    step.step
                )));
            }
        }
    }

    // Cycle detection over the dependency edges
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        if let Some(id) = step.result_id.as_deref() {
            in_degree.entry(id).or_insert(0);
            for dep in &step.depends_on {
                edges.entry(dep.as_str()).or_default().push(id);
                *in_degree.entry(id).or_insert(0) += 1;
            }
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop() {
        visited += 1;
        if let Some(next) = edges.get(id) {
            for &target in next {
                let degree = in_degree.get_mut(target).expect("edge target tracked");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(target);
                }
            }
        }
    }

    if visited != in_degree.len() {
        return Err(ServiceError::internal("workflow dependencies contain a cycle"));
    }

    Ok(())
}

/// The next step whose dependencies are all completed, if any. The engine
/// never executes steps itself; callers drive the workflow.
pub fn next_ready_step(workflow: &Workflow) -> Option<&WorkflowStep> {
    let completed: std::collections::HashSet<&str> = workflow
        .steps
        .iter()
        .filter(|s| s.status == WorkflowStepStatus::Completed)
        .filter_map(|s| s.result_id.as_deref())
        .collect();

    workflow.steps.iter().find(|step| {
        step.status == WorkflowStepStatus::Pending
            && step.depends_on.iter().all(|dep| completed.contains(dep.as_str()))
    })
}
