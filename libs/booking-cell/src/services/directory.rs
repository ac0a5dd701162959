// libs/booking-cell/src/services/directory.rs
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_database::RestClient;

use crate::models::{BookingPolicy, ProviderInfo, ServiceInfo};

/// Read-only view of providers and their services, owned by another system.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn get_provider(&self, provider_id: Uuid) -> Result<Option<ProviderInfo>>;

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceInfo>>;
}

/// Settlement state of a booking's payment, owned by the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn is_settled(&self, booking_id: Uuid) -> Result<bool>;
}

// ==============================================================================
// REST-BACKED COLLABORATORS
// ==============================================================================

#[derive(Debug, Deserialize)]
struct ProviderRow {
    id: Uuid,
    #[serde(default)]
    booking_policy: BookingPolicy,
}

#[derive(Debug, Deserialize)]
struct ServiceRow {
    id: Uuid,
    #[serde(default)]
    provider_id: Option<Uuid>,
    duration_minutes: i32,
    price_cents: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentRow {
    status: String,
}

pub struct RestProviderDirectory {
    client: RestClient,
}

impl RestProviderDirectory {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderDirectory for RestProviderDirectory {
    async fn get_provider(&self, provider_id: Uuid) -> Result<Option<ProviderInfo>> {
        debug!("Looking up provider {}", provider_id);
        let row: Option<ProviderRow> = self
            .client
            .find_one("providers", "id", &provider_id.to_string())
            .await?;

        Ok(row.map(|row| ProviderInfo {
            id: row.id,
            booking_policy: row.booking_policy,
        }))
    }

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceInfo>> {
        debug!("Looking up service {}", service_id);
        let row: Option<ServiceRow> = self
            .client
            .find_one("services", "id", &service_id.to_string())
            .await?;

        Ok(row.map(|row| ServiceInfo {
            id: row.id,
            provider_id: row.provider_id,
            duration_minutes: row.duration_minutes,
            price_cents: row.price_cents,
        }))
    }
}

pub struct RestPaymentGateway {
    client: RestClient,
}

impl RestPaymentGateway {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PaymentGateway for RestPaymentGateway {
    async fn is_settled(&self, booking_id: Uuid) -> Result<bool> {
        let row: Option<PaymentRow> = self
            .client
            .find_one("payments", "booking_id", &booking_id.to_string())
            .await?;

        Ok(matches!(row, Some(payment) if payment.status == "succeeded"))
    }
}

// ==============================================================================
// STATIC COLLABORATORS
// ==============================================================================

/// Fixed provider catalogue for local runs and tests.
#[derive(Default)]
pub struct StaticProviderDirectory {
    providers: RwLock<HashMap<Uuid, ProviderInfo>>,
    services: RwLock<HashMap<Uuid, ServiceInfo>>,
}

impl StaticProviderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, provider: ProviderInfo) {
        let mut providers = self.providers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        providers.insert(provider.id, provider);
    }

    pub fn add_service(&self, service: ServiceInfo) {
        let mut services = self.services.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        services.insert(service.id, service);
    }
}

#[async_trait]
impl ProviderDirectory for StaticProviderDirectory {
    async fn get_provider(&self, provider_id: Uuid) -> Result<Option<ProviderInfo>> {
        let providers = self.providers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(providers.get(&provider_id).cloned())
    }

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceInfo>> {
        let services = self.services.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(services.get(&service_id).cloned())
    }
}

/// Payment state kept in memory; bookings are unsettled until marked.
#[derive(Default)]
pub struct StaticPaymentGateway {
    settled: RwLock<HashSet<Uuid>>,
}

impl StaticPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_settled(&self, booking_id: Uuid) {
        let mut settled = self.settled.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        settled.insert(booking_id);
    }
}

#[async_trait]
impl PaymentGateway for StaticPaymentGateway {
    async fn is_settled(&self, booking_id: Uuid) -> Result<bool> {
        let settled = self.settled.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(settled.contains(&booking_id))
    }
}
