//! # Domain Executor Registry
//!
//! Named collection of per-domain handlers. The registry is built at boot
//! and read as an immutable snapshot on the hot path; replacement goes
//! through a writer-serialised swap. Registration is idempotent by id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::classifier::DomainProfile;
use crate::error::ServiceError;
use crate::types::{Action, ExecuteOptions, ResultItem, UserContext, Workflow, WorkflowStep, WorkflowStepStatus};

/// Output of one domain invocation
#[derive(Debug, Clone, Default)]
pub struct DomainOutput {
    pub results: Vec<ResultItem>,
    /// Multi-step plan, when the domain produced one
    pub workflow: Option<Workflow>,
}

/// A back-end capability that can answer a slice of a query
#[async_trait]
pub trait DomainExecutor: Send + Sync {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn keywords(&self) -> &[String];
    /// Execution priority in [0, 100]
    fn priority(&self) -> i32;
    /// Per-domain invocation budget
    fn timeout_ms(&self) -> u64;

    async fn invoke(
        &self,
        query: &str,
        context: Option<&UserContext>,
        options: Option<&ExecuteOptions>,
    ) -> Result<DomainOutput, ServiceError>;
}

/// Registry snapshot handed to the engine. Swapping the whole map keeps the
/// hot path lock-free after the initial read.
#[derive(Clone)]
pub struct DomainRegistry {
    domains: Arc<RwLock<Arc<HashMap<String, Arc<dyn DomainExecutor>>>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            domains: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }

    /// Registers an executor. Re-registering an id replaces the previous
    /// handler.
    pub async fn register(&self, executor: Arc<dyn DomainExecutor>) {
        let mut guard = self.domains.write().await;
        let mut next = HashMap::clone(&guard);
        info!(domain = %executor.id(), "Domain registered");
        next.insert(executor.id().to_string(), executor);
        *guard = Arc::new(next);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn DomainExecutor>> {
        self.domains.read().await.get(id).cloned()
    }

    /// The current immutable snapshot
    pub async fn snapshot(&self) -> Arc<HashMap<String, Arc<dyn DomainExecutor>>> {
        self.domains.read().await.clone()
    }

    /// Classifier-facing profiles for every registered domain
    pub async fn profiles(&self) -> Vec<DomainProfile> {
        self.domains
            .read()
            .await
            .values()
            .map(|executor| DomainProfile {
                id: executor.id().to_string(),
                name: executor.title().to_string(),
                keywords: executor.keywords().to_vec(),
                priority: executor.priority(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.domains.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.domains.read().await.is_empty()
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers the four built-in synthetic domains
pub async fn register_builtin_domains(registry: &DomainRegistry) {
    registry.register(Arc::new(CommerceDomain::new())).await;
    registry.register(Arc::new(RecipesDomain::new())).await;
    registry.register(Arc::new(TravelDomain::new())).await;
    registry.register(Arc::new(KnowledgeDomain::new())).await;
}

fn purchase_intent(query: &str) -> bool {
    let query = query.to_lowercase();
    ["купить", "заказать", "приобрести"].iter().any(|kw| query.contains(kw))
}

// ---------------------------------------------------------------------------
// Built-in domains
// ---------------------------------------------------------------------------

pub struct CommerceDomain {
    keywords: Vec<String>,
}

impl CommerceDomain {
    pub fn new() -> Self {
        Self {
            keywords: ["купить", "цена", "магазин", "товар", "заказать"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DomainExecutor for CommerceDomain {
    fn id(&self) -> &str {
        "commerce"
    }

    fn title(&self) -> &str {
        "Коммерческие предложения"
    }

    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn priority(&self) -> i32 {
        80
    }

    fn timeout_ms(&self) -> u64 {
        10_000
    }

    async fn invoke(
        &self,
        query: &str,
        context: Option<&UserContext>,
        _options: Option<&ExecuteOptions>,
    ) -> Result<DomainOutput, ServiceError> {
        let currency = context
            .and_then(|c| c.currency.as_deref())
            .unwrap_or("RUB");

        let item = ResultItem {
            id: Uuid::new_v4().to_string(),
            item_type: "product".to_string(),
            title: "Рекомендуемый товар".to_string(),
            description: Some("На основе вашего запроса мы подобрали оптимальный вариант".to_string()),
            data: HashMap::from([
                ("price".to_string(), json!("1500")),
                ("currency".to_string(), json!(currency)),
                ("availability".to_string(), json!("в наличии")),
                ("rating".to_string(), json!("4.5")),
            ]),
            relevance: 0.95,
            confidence: 0.88,
            actions: vec![Action {
                action_type: "purchase".to_string(),
                label: "Купить".to_string(),
                url: Some("/api/v1/commerce/purchase".to_string()),
                method: Some("POST".to_string()),
                confirm_text: None,
            }],
        };

        // Purchase-intent queries get the multi-step order plan
        let workflow = if purchase_intent(query) {
            let order_id = item.id.clone();
            let payment_id = Uuid::new_v4().to_string();
            let delivery_id = Uuid::new_v4().to_string();
            Some(Workflow {
                steps: vec![
                    WorkflowStep {
                        step: 1,
                        action: "place_order".to_string(),
                        domain: "commerce".to_string(),
                        status: WorkflowStepStatus::Pending,
                        result_id: Some(order_id.clone()),
                        depends_on: vec![],
                    },
                    WorkflowStep {
                        step: 2,
                        action: "process_payment".to_string(),
                        domain: "payment".to_string(),
                        status: WorkflowStepStatus::Pending,
                        result_id: Some(payment_id.clone()),
                        depends_on: vec![order_id.clone()],
                    },
                    WorkflowStep {
                        step: 3,
                        action: "schedule_delivery".to_string(),
                        domain: "delivery".to_string(),
                        status: WorkflowStepStatus::Pending,
                        result_id: Some(delivery_id.clone()),
                        depends_on: vec![payment_id.clone()],
                    },
                    WorkflowStep {
                        step: 4,
                        action: "notify_customer".to_string(),
                        domain: "notifications".to_string(),
                        status: WorkflowStepStatus::Pending,
                        result_id: None,
                        depends_on: vec![delivery_id],
                    },
                ],
            })
        } else {
            None
        };

        Ok(DomainOutput { results: vec![item], workflow })
    }
}

pub struct RecipesDomain {
    keywords: Vec<String>,
}

impl RecipesDomain {
    pub fn new() -> Self {
        Self {
            keywords: ["рецепт", "готовить", "еда", "кухня", "ингредиенты"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DomainExecutor for RecipesDomain {
    fn id(&self) -> &str {
        "recipes"
    }

    fn title(&self) -> &str {
        "Рецепты и кулинария"
    }

    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn priority(&self) -> i32 {
        70
    }

    fn timeout_ms(&self) -> u64 {
        10_000
    }

    async fn invoke(
        &self,
        _query: &str,
        _context: Option<&UserContext>,
        _options: Option<&ExecuteOptions>,
    ) -> Result<DomainOutput, ServiceError> {
        let item = ResultItem {
            id: Uuid::new_v4().to_string(),
            item_type: "recipe".to_string(),
            title: "Рецепт блюда".to_string(),
            description: Some("Подробный рецепт с ингредиентами и инструкцией".to_string()),
            data: HashMap::from([
                ("cooking_time".to_string(), json!("45 мин")),
                ("difficulty".to_string(), json!("средний")),
                ("servings".to_string(), json!("4 порции")),
            ]),
            relevance: 0.92,
            confidence: 0.85,
            actions: vec![Action {
                action_type: "view_recipe".to_string(),
                label: "Посмотреть рецепт".to_string(),
                url: Some("/api/v1/recipes/details".to_string()),
                method: Some("GET".to_string()),
                confirm_text: None,
            }],
        };

        Ok(DomainOutput { results: vec![item], workflow: None })
    }
}

pub struct TravelDomain {
    keywords: Vec<String>,
}

impl TravelDomain {
    pub fn new() -> Self {
        Self {
            keywords: ["отель", "бронировать", "путешествие", "тур", "авиабилет"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DomainExecutor for TravelDomain {
    fn id(&self) -> &str {
        "travel"
    }

    fn title(&self) -> &str {
        "Путешествия и туризм"
    }

    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn priority(&self) -> i32 {
        70
    }

    fn timeout_ms(&self) -> u64 {
        15_000
    }

    async fn invoke(
        &self,
        _query: &str,
        context: Option<&UserContext>,
        _options: Option<&ExecuteOptions>,
    ) -> Result<DomainOutput, ServiceError> {
        let location = context
            .and_then(|c| c.region.as_deref())
            .unwrap_or("RU");

        let item = ResultItem {
            id: Uuid::new_v4().to_string(),
            item_type: "hotel".to_string(),
            title: "Рекомендация отеля".to_string(),
            description: Some("Идеальный вариант для вашего путешествия".to_string()),
            data: HashMap::from([
                ("location".to_string(), json!("Москва")),
                ("region".to_string(), json!(location)),
                ("price_per_night".to_string(), json!("5000 руб")),
                ("rating".to_string(), json!("4.7")),
                ("amenities".to_string(), json!("WiFi, бассейн, завтрак")),
            ]),
            relevance: 0.89,
            confidence: 0.82,
            actions: vec![Action {
                action_type: "book_hotel".to_string(),
                label: "Забронировать".to_string(),
                url: Some("/api/v1/travel/book".to_string()),
                method: Some("POST".to_string()),
                confirm_text: Some("Подтвердить бронирование?".to_string()),
            }],
        };

        Ok(DomainOutput { results: vec![item], workflow: None })
    }
}

pub struct KnowledgeDomain {
    keywords: Vec<String>,
}

impl KnowledgeDomain {
    pub fn new() -> Self {
        Self {
            keywords: ["документ", "инструкция", "руководство", "справка"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DomainExecutor for KnowledgeDomain {
    fn id(&self) -> &str {
        "knowledge"
    }

    fn title(&self) -> &str {
        "Справочная информация"
    }

    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    fn priority(&self) -> i32 {
        50
    }

    fn timeout_ms(&self) -> u64 {
        10_000
    }

    async fn invoke(
        &self,
        _query: &str,
        _context: Option<&UserContext>,
        _options: Option<&ExecuteOptions>,
    ) -> Result<DomainOutput, ServiceError> {
        let item = ResultItem {
            id: Uuid::new_v4().to_string(),
            item_type: "document".to_string(),
            title: "Справочная информация".to_string(),
            description: Some("Подробная информация по вашему запросу".to_string()),
            data: HashMap::from([
                ("source".to_string(), json!("официальная документация")),
                ("category".to_string(), json!("справочная информация")),
            ]),
            relevance: 0.87,
            confidence: 0.80,
            actions: vec![Action {
                action_type: "view_document".to_string(),
                label: "Посмотреть".to_string(),
                url: Some("/api/v1/knowledge/view".to_string()),
                method: Some("GET".to_string()),
                confirm_text: None,
            }],
        };

        Ok(DomainOutput { results: vec![item], workflow: None })
    }
}
