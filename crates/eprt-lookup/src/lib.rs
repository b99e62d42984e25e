//! Multi-source permit lookup: expiry resolution plus the fixed-order
//! fallback orchestration with first-value-wins summary merging.
//!
//! Every step runs (no early exit); a failing source is logged and treated
//! as having found nothing, so the orchestrator always hands back a
//! structured result. The only hard rejection is a malformed tax id, which
//! happens before any source is touched.

use async_trait::async_trait;
use eprt_core::{
    FacilitySummary, LookupResult, LookupSummary, PermitAggregate, PermitDate, PermitRecord,
    SummaryField, TaxId, TaxIdError,
};
use eprt_sources::{normalize_air_row, normalize_water_row, GovRegistryClient};
use eprt_store::PermitStore;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "eprt-lookup";

/// Step names, in execution order. Used for logging and step-failure
/// attribution; the order here is the precedence order of the merge.
pub const STEP_REGISTRY: &str = "registry";
pub const STEP_WATER_BY_TAX_ID: &str = "water_by_tax_id";
pub const STEP_WATER_BY_FACILITY: &str = "water_by_facility";
pub const STEP_FACTORIES: &str = "factories";
pub const STEP_AIR_BY_FACILITY: &str = "air_by_facility";

pub const LOOKUP_STEPS: [&str; 5] = [
    STEP_REGISTRY,
    STEP_WATER_BY_TAX_ID,
    STEP_WATER_BY_FACILITY,
    STEP_FACTORIES,
    STEP_AIR_BY_FACILITY,
];

/// Source labels carried on the water aggregate. Wire values consumed by
/// the client portal; do not rename.
pub const SOURCE_WATER_BY_TAX_ID: &str = "supabase_ban";
pub const SOURCE_WATER_BY_FACILITY: &str = "supabase";
pub const SOURCE_AIR: &str = "supabase";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    InvalidTaxId(#[from] TaxIdError),
}

/// Pick the record with the chronologically latest end date.
///
/// A record with no end date never wins; if every record lacks one, the
/// first record is returned. Ties resolve to the first record in input
/// order — a deliberate stable tie-break.
pub fn latest_by_end_date(records: &[PermitRecord]) -> Option<&PermitRecord> {
    let mut best = records.first()?;
    for record in &records[1..] {
        match (record.end_date, best.end_date) {
            (Some(candidate), Some(current)) if candidate > current => best = record,
            (Some(_), None) => best = record,
            _ => {}
        }
    }
    Some(best)
}

/// First-value-wins summary merge. Returns whether the value was taken.
/// Later steps can never overwrite a field an earlier step resolved.
pub fn merge_summary(summary: &mut LookupSummary, field: SummaryField, value: Option<String>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if value.is_empty() || summary.contains_key(&field) {
        return false;
    }
    summary.insert(field, value);
    true
}

/// Normalized view of one `factories` row: the per-family permit end dates
/// it is the sole internal source for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactorySnapshot {
    pub company_name: String,
    pub water_end: Option<PermitDate>,
    pub air_end: Option<PermitDate>,
    pub waste_end: Option<PermitDate>,
    pub toxic_end: Option<PermitDate>,
}

/// The government facility registry, keyed by tax id.
#[async_trait]
pub trait FacilityRegistry: Send + Sync {
    async fn facilities_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Vec<PermitRecord>>;
}

/// The internal permits database, already normalized to canonical records.
#[async_trait]
pub trait PermitsBackend: Send + Sync {
    async fn water_permits_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Vec<PermitRecord>>;
    async fn water_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> anyhow::Result<Vec<PermitRecord>>;
    async fn air_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> anyhow::Result<Vec<PermitRecord>>;
    async fn factory_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Option<FactorySnapshot>>;
}

#[async_trait]
impl FacilityRegistry for GovRegistryClient {
    async fn facilities_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Vec<PermitRecord>> {
        Ok(GovRegistryClient::facilities_by_tax_id(self, tax_id).await?)
    }
}

#[async_trait]
impl PermitsBackend for PermitStore {
    async fn water_permits_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Vec<PermitRecord>> {
        let rows = PermitStore::water_permits_by_tax_id(self, tax_id.as_str(), tax_id.unpadded())
            .await?;
        Ok(rows.iter().map(normalize_water_row).collect())
    }

    async fn water_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> anyhow::Result<Vec<PermitRecord>> {
        let rows = PermitStore::water_permits_by_facility_ids(self, facility_ids).await?;
        Ok(rows.iter().map(normalize_water_row).collect())
    }

    async fn air_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> anyhow::Result<Vec<PermitRecord>> {
        let rows = PermitStore::air_permits_by_facility_ids(self, facility_ids).await?;
        Ok(rows.iter().map(normalize_air_row).collect())
    }

    async fn factory_by_tax_id(&self, tax_id: &TaxId) -> anyhow::Result<Option<FactorySnapshot>> {
        let row = PermitStore::factory_by_tax_id(self, tax_id.as_str()).await?;
        Ok(row.map(|row| {
            let date = |value: &Option<String>| {
                value.as_deref().and_then(|v| PermitDate::parse_lenient(v))
            };
            FactorySnapshot {
                company_name: row.company_name.clone().unwrap_or_default(),
                water_end: date(&row.waterreleasedate),
                air_end: date(&row.airreleasedate),
                waste_end: date(&row.wastereleasedate),
                toxic_end: date(&row.toxicreleasedate),
            }
        }))
    }
}

/// Fixed-order multi-source lookup. Sources are constructor-injected so the
/// precedence rules are testable with in-memory stubs.
pub struct LookupOrchestrator<R, B> {
    registry: R,
    backend: B,
}

impl<R: FacilityRegistry, B: PermitsBackend> LookupOrchestrator<R, B> {
    pub fn new(registry: R, backend: B) -> Self {
        Self { registry, backend }
    }

    pub async fn lookup(&self, raw_tax_id: &str) -> Result<LookupResult, LookupError> {
        let tax_id = TaxId::new(raw_tax_id)?;
        let mut result = LookupResult::empty(&tax_id);

        // Step 1: government registry. Also yields the candidate facility
        // ids the facility-keyed steps fan out over.
        let registry_records =
            degrade(STEP_REGISTRY, self.registry.facilities_by_tax_id(&tax_id).await);
        let facility_ids = distinct_facility_ids(&registry_records);
        result.found |= !registry_records.is_empty();
        result.facilities = registry_records.iter().map(facility_summary).collect();

        // Step 2: internal water permits by tax id (literal and unpadded).
        let water_by_tax = degrade(
            STEP_WATER_BY_TAX_ID,
            self.backend.water_permits_by_tax_id(&tax_id).await,
        );
        if !water_by_tax.is_empty() {
            self.take_water(&mut result, SOURCE_WATER_BY_TAX_ID, &water_by_tax);
        } else if !facility_ids.is_empty() {
            // Step 3: only when step 2 came back empty and step 1 produced
            // candidate facilities.
            let water_by_facility = degrade(
                STEP_WATER_BY_FACILITY,
                self.backend.water_permits_by_facility_ids(&facility_ids).await,
            );
            if !water_by_facility.is_empty() {
                self.take_water(&mut result, SOURCE_WATER_BY_FACILITY, &water_by_facility);
            }
        }

        // Step 4: factories. Water fills only a still-empty slot; the three
        // non-water dates have no other source.
        let factory = degrade(STEP_FACTORIES, self.backend.factory_by_tax_id(&tax_id).await);
        if let Some(snapshot) = factory {
            result.found = true;
            let date = |value: Option<PermitDate>| value.map(|d| d.to_string());
            merge_summary(&mut result.summary, SummaryField::WaterPermitEndDate, date(snapshot.water_end));
            merge_summary(&mut result.summary, SummaryField::AirPermitEndDate, date(snapshot.air_end));
            merge_summary(&mut result.summary, SummaryField::WastePermitEndDate, date(snapshot.waste_end));
            merge_summary(&mut result.summary, SummaryField::ToxicPermitEndDate, date(snapshot.toxic_end));
        }

        // Air aggregate: count and latest expiry from the internal air
        // table. Never writes summary fields; the exact air end date in the
        // summary stays owned by the factories step.
        if !facility_ids.is_empty() {
            let air = degrade(
                STEP_AIR_BY_FACILITY,
                self.backend.air_permits_by_facility_ids(&facility_ids).await,
            );
            if !air.is_empty() {
                result.found = true;
                result.air = Some(PermitAggregate {
                    source: SOURCE_AIR.to_string(),
                    permit_count: air.len(),
                    latest_end: latest_by_end_date(&air).and_then(|r| r.end_date),
                });
            }
        }

        debug!(
            tax_id = tax_id.as_str(),
            found = result.found,
            facilities = result.facilities.len(),
            "lookup complete"
        );
        Ok(result)
    }

    fn take_water(&self, result: &mut LookupResult, source: &str, records: &[PermitRecord]) {
        result.found = true;
        let latest = latest_by_end_date(records).and_then(|r| r.end_date);
        result.water = Some(PermitAggregate {
            source: source.to_string(),
            permit_count: records.len(),
            latest_end: latest,
        });
        merge_summary(
            &mut result.summary,
            SummaryField::WaterPermitEndDate,
            latest.map(|d| d.to_string()),
        );
    }
}

/// A failed step degrades to an empty result for that source only.
fn degrade<T: Default>(step: &'static str, outcome: anyhow::Result<T>) -> T {
    match outcome {
        Ok(value) => value,
        Err(err) => {
            warn!(step, error = %err, "lookup step failed; continuing with remaining sources");
            T::default()
        }
    }
}

fn distinct_facility_ids(records: &[PermitRecord]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for record in records {
        if let Some(id) = record.facility_id.as_deref() {
            if !id.is_empty() && !out.iter().any(|seen| seen == id) {
                out.push(id.to_string());
            }
        }
    }
    out
}

fn facility_summary(record: &PermitRecord) -> FacilitySummary {
    FacilitySummary {
        facility_id: record.facility_id.clone().unwrap_or_default(),
        facility_name: record.facility_name.clone(),
        address: record.address.clone(),
        permit_number: record.permit_number.clone(),
        permit_type: record.permit_type,
    }
}
