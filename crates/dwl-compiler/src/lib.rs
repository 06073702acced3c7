// crates/dwl-compiler/src/lib.rs
//
// The mapping -> job-flow compiler: validates and persists mappings and
// their column details, and produces the self-contained compiled flow the
// execution engine consumes. Rejections are structured {code, procedure,
// params, message}, persisted to dwl_error_records, and raised.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use dwl_schemas::codes::{FrequencyCode, StatusFlag};
use dwl_schemas::{
    parse_weekday, MapLogic, Mapping, MappingDetailDraft, MappingDraft, ScheduleDraft,
};
use dwl_store::{
    details, error_records, job_flows, mappings, schedules, snippets, IdProvider, Store,
    StoreError,
};

pub mod compile;
pub mod errors;
pub mod naming;
pub mod registry;
pub mod source;
pub mod validate;

pub use errors::{codes, CompilerError, ValidationError};

pub struct Compiler {
    store: Store,
    /// Connection the SQL/logic prepare checks run against (the data side;
    /// statements are prepared there, never executed).
    source_store: Store,
    ids: Arc<IdProvider>,
    actor: String,
}

impl Compiler {
    pub fn new(store: Store, source_store: Store, ids: Arc<IdProvider>, actor: &str) -> Self {
        Self {
            store,
            source_store,
            ids,
            actor: actor.to_string(),
        }
    }

    // -- snippets ------------------------------------------------------------

    /// Insert if new; return the existing id when the normalized body is
    /// unchanged; historize otherwise.
    pub async fn upsert_sql_snippet(&self, code: &str, body: &str) -> Result<i64, CompilerError> {
        if code.trim().is_empty() {
            return Err(self
                .reject(
                    None,
                    ValidationError::new(
                        codes::SNIPPET_CODE_NULL,
                        "upsert_sql_snippet",
                        [],
                        "SQL Code cannot be null",
                    ),
                )
                .await);
        }
        let (id, changed) = snippets::upsert(&self.store, &self.ids, code, body, &self.actor).await?;
        if changed {
            info!(code, id, "sql snippet stored");
        }
        Ok(id)
    }

    // -- mapping / detail upserts -------------------------------------------

    pub async fn upsert_mapping(&self, draft: &MappingDraft) -> Result<i64, CompilerError> {
        const PROCEDURE: &str = "upsert_mapping";
        let reference = draft.reference.clone();

        if let Err(e) = self.check_mapping_draft(PROCEDURE, draft) {
            return Err(self.reject(Some(&reference), e).await);
        }

        let (id, changed) =
            mappings::upsert(&self.store, &self.ids, draft, &self.actor).await?;
        if changed {
            info!(reference = %draft.reference, id, "mapping stored");
        }
        Ok(id)
    }

    pub async fn upsert_mapping_detail(
        &self,
        draft: &MappingDetailDraft,
    ) -> Result<i64, CompilerError> {
        const PROCEDURE: &str = "upsert_mapping_detail";
        let reference = draft.mapping_reference.clone();

        let checks = || -> Result<(), ValidationError> {
            naming::check_identifier(PROCEDURE, "target_column", &draft.target_column)?;
            naming::check_identifier(PROCEDURE, "value_column", &draft.value_column)?;
            for key in &draft.key_columns {
                naming::check_identifier(PROCEDURE, "key_column", key)?;
            }
            if draft.target_data_type.trim().is_empty() {
                return Err(ValidationError::new(
                    codes::NULL_FIELD,
                    PROCEDURE,
                    ["target_data_type".to_string()],
                    "target_data_type cannot be null",
                ));
            }
            Ok(())
        };
        if let Err(e) = checks() {
            return Err(self.reject(Some(&reference), e).await);
        }

        // A snippet reference must resolve at write time.
        if let MapLogic::Snippet(code) = &draft.map_logic {
            if code.trim().is_empty() {
                let e = ValidationError::new(
                    codes::SNIPPET_CODE_NULL,
                    PROCEDURE,
                    [],
                    "SQL Code cannot be null",
                );
                return Err(self.reject(Some(&reference), e).await);
            }
            if snippets::current(&self.store, code).await?.is_none() {
                let e = ValidationError::new(
                    codes::LOGIC_INVALID,
                    PROCEDURE,
                    [code.clone()],
                    format!("SQL snippet {code} does not exist"),
                );
                return Err(self.reject(Some(&reference), e).await);
            }
        }

        let (id, _changed) =
            details::upsert(&self.store, &self.ids, draft, &self.actor).await?;
        Ok(id)
    }

    // -- validation ----------------------------------------------------------

    /// Does the body parse as a read-only query on the target dialect?
    /// Prepared, never executed.
    pub async fn validate_sql(&self, body: &str) -> Result<bool, CompilerError> {
        let trimmed = body.trim_start().to_ascii_lowercase();
        if !(trimmed.starts_with("select") || trimmed.starts_with("with")) {
            return Ok(false);
        }
        match self.source_store.prepare_columns(body).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_transient() => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    /// Confirm the (resolved) logic projects the declared key and value
    /// columns.
    pub async fn validate_logic(
        &self,
        map_logic: &MapLogic,
        key_columns: &[String],
        value_column: &str,
    ) -> Result<(), CompilerError> {
        const PROCEDURE: &str = "validate_logic";
        let sql = self.resolve_logic(PROCEDURE, map_logic).await?;
        let projection = match self.source_store.prepare_columns(&sql).await {
            Ok(cols) => cols,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                return Err(CompilerError::Validation(ValidationError::new(
                    codes::LOGIC_INVALID,
                    PROCEDURE,
                    [e.to_string()],
                    "Logic does not parse on the target connection",
                )))
            }
        };
        let have: Vec<String> = projection.iter().map(|c| c.to_ascii_lowercase()).collect();
        for needed in key_columns.iter().chain(std::iter::once(&value_column.to_string())) {
            if !have.contains(&needed.to_ascii_lowercase()) {
                return Err(CompilerError::Validation(ValidationError::new(
                    codes::LOGIC_INVALID,
                    PROCEDURE,
                    [needed.clone()],
                    format!("Column {needed} is not selected by the logic"),
                )));
            }
        }
        Ok(())
    }

    /// The full rule set of one mapping: naming, details structure, logic
    /// projections, checkpoint column. The gate for activation and
    /// compilation.
    pub async fn validate_mapping(&self, reference: &str) -> Result<(), CompilerError> {
        const PROCEDURE: &str = "validate_mapping";
        let mapping = self.require_mapping(PROCEDURE, reference).await?;
        let detail_rows = details::all_current(&self.store, reference).await?;
        let drafts: Vec<MappingDetailDraft> =
            detail_rows.into_iter().map(|d| d.draft).collect();

        if let Err(e) = self.check_mapping_draft(PROCEDURE, &mapping.draft) {
            return Err(self.reject(Some(reference), e).await);
        }
        if let Err(e) = validate::validate_details(self.store.dialect(), &drafts) {
            return Err(self.reject(Some(reference), e).await);
        }

        // One prepare per combination group, then containment per detail.
        let mut checked: HashMap<i32, ()> = HashMap::new();
        for d in &drafts {
            if checked.insert(d.combination_code, ()).is_some() {
                continue;
            }
            let group: Vec<&MappingDetailDraft> = drafts
                .iter()
                .filter(|x| x.combination_code == d.combination_code)
                .collect();
            for member in &group {
                if let Err(e) = self
                    .validate_logic(&member.map_logic, &member.key_columns, &member.value_column)
                    .await
                {
                    return Err(match e {
                        CompilerError::Validation(v) => self.reject(Some(reference), v).await,
                        other => other,
                    });
                }
            }
        }

        // KEY checkpoints need their column among the target columns.
        if let Err(e) = compile::check_checkpoint(PROCEDURE, &mapping.draft, &drafts) {
            return Err(self.reject(Some(reference), e).await);
        }

        Ok(())
    }

    // -- lifecycle -----------------------------------------------------------

    /// Validate, then flip the mapping active. Activation without a passing
    /// validation is not possible through this API.
    pub async fn activate(&self, reference: &str) -> Result<(), CompilerError> {
        self.validate_mapping(reference).await?;
        mappings::set_status(&self.store, reference, StatusFlag::Active).await?;
        info!(reference, "mapping activated");
        Ok(())
    }

    pub async fn deactivate(&self, reference: &str) -> Result<(), CompilerError> {
        mappings::set_status(&self.store, reference, StatusFlag::Inactive).await?;
        info!(reference, "mapping deactivated");
        Ok(())
    }

    /// Refused while a job flow references the mapping.
    pub async fn delete_mapping(&self, reference: &str) -> Result<(), CompilerError> {
        const PROCEDURE: &str = "delete_mapping";
        if job_flows::exists_for(&self.store, reference).await? {
            let e = ValidationError::new(
                codes::DELETE_REFUSED,
                PROCEDURE,
                [reference.to_string()],
                format!("Mapping {reference} is referenced by a job flow"),
            );
            return Err(self.reject(Some(reference), e).await);
        }
        schedules::delete_for(&self.store, reference).await?;
        details::delete_all(&self.store, reference).await?;
        mappings::delete(&self.store, reference).await?;
        info!(reference, "mapping deleted");
        Ok(())
    }

    pub async fn delete_detail(
        &self,
        reference: &str,
        target_column: &str,
    ) -> Result<(), CompilerError> {
        const PROCEDURE: &str = "delete_detail";
        if job_flows::exists_for(&self.store, reference).await? {
            let e = ValidationError::new(
                codes::DELETE_REFUSED,
                PROCEDURE,
                [reference.to_string(), target_column.to_string()],
                format!("Detail {target_column} is referenced by a job flow"),
            );
            return Err(self.reject(Some(reference), e).await);
        }
        details::delete(&self.store, reference, target_column).await?;
        Ok(())
    }

    /// Drop the compiled flow (and its schedule); required before the
    /// mapping itself may be deleted.
    pub async fn delete_job_flow(&self, reference: &str) -> Result<(), CompilerError> {
        schedules::delete_for(&self.store, reference).await?;
        job_flows::delete_for(&self.store, reference).await?;
        Ok(())
    }

    // -- compile -------------------------------------------------------------

    /// Validate and produce the current job flow for a mapping. Idempotent
    /// for an unchanged mapping: the existing current row is kept.
    pub async fn compile(&self, reference: &str) -> Result<i64, CompilerError> {
        const PROCEDURE: &str = "compile";
        self.validate_mapping(reference).await?;

        let mapping = self.require_mapping(PROCEDURE, reference).await?;
        let detail_rows = details::all_current(&self.store, reference).await?;
        let drafts: Vec<MappingDetailDraft> =
            detail_rows.into_iter().map(|d| d.draft).collect();

        // Resolve snippet references once, per combination group.
        let mut resolved: HashMap<i32, String> = HashMap::new();
        for d in &drafts {
            if !resolved.contains_key(&d.combination_code) {
                let sql = self.resolve_logic(PROCEDURE, &d.map_logic).await?;
                resolved.insert(d.combination_code, sql);
            }
        }

        let flow = match compile::build_flow(
            self.store.dialect(),
            &mapping.draft,
            &drafts,
            &resolved,
        ) {
            Ok(flow) => flow,
            Err(e) => return Err(self.reject(Some(reference), e).await),
        };

        // The dependency edge survives recompilation; the DAG is re-checked
        // against the current flow set.
        let existing_dependency = job_flows::current(&self.store, reference)
            .await?
            .and_then(|f| f.dependency_id);
        if let Some(dep) = existing_dependency {
            let all = job_flows::all_current(&self.store).await?;
            if let Err(e) = compile::check_dependency_dag(PROCEDURE, reference, dep, &all) {
                return Err(self.reject(Some(reference), e).await);
            }
        }

        let dw_logic = serde_json::to_string(&flow)
            .map_err(|e| CompilerError::Store(StoreError::Payload(e)))?;
        let (id, changed) = job_flows::upsert(
            &self.store,
            &self.ids,
            reference,
            &dw_logic,
            mapping.draft.block_process_rows,
            mapping.draft.target_connection_id,
            existing_dependency,
            &self.actor,
        )
        .await?;
        if changed {
            info!(reference, job_flow_id = id, "job flow compiled");
        }
        Ok(id)
    }

    /// Point a mapping's flow at a prerequisite flow (or clear it). The DAG
    /// stays acyclic.
    pub async fn set_dependency(
        &self,
        reference: &str,
        dependency_id: Option<i64>,
    ) -> Result<(), CompilerError> {
        const PROCEDURE: &str = "set_dependency";
        let Some(flow) = job_flows::current(&self.store, reference).await? else {
            let e = ValidationError::new(
                codes::NULL_FIELD,
                PROCEDURE,
                [reference.to_string()],
                format!("Mapping {reference} has no compiled job flow"),
            );
            return Err(self.reject(Some(reference), e).await);
        };
        if let Some(dep) = dependency_id {
            let all = job_flows::all_current(&self.store).await?;
            if let Err(e) = compile::check_dependency_dag(PROCEDURE, reference, dep, &all) {
                return Err(self.reject(Some(reference), e).await);
            }
        }
        job_flows::upsert(
            &self.store,
            &self.ids,
            reference,
            &flow.dw_logic,
            flow.block_process_rows,
            flow.target_connection_id,
            dependency_id,
            &self.actor,
        )
        .await?;
        Ok(())
    }

    // -- schedule ------------------------------------------------------------

    /// Create or replace the schedule of a compiled mapping.
    pub async fn upsert_schedule(&self, draft: &ScheduleDraft) -> Result<i64, CompilerError> {
        const PROCEDURE: &str = "upsert_schedule";
        let reference = draft.mapping_reference.clone();
        let Some(flow) = job_flows::current(&self.store, &reference).await? else {
            let e = ValidationError::new(
                codes::NULL_FIELD,
                PROCEDURE,
                [reference.clone()],
                format!("Mapping {reference} has no compiled job flow"),
            );
            return Err(self.reject(Some(&reference), e).await);
        };
        if let Err(e) = check_schedule_draft(PROCEDURE, draft) {
            return Err(self.reject(Some(&reference), e).await);
        }
        Ok(schedules::upsert(&self.store, &self.ids, flow.id, draft).await?)
    }

    // -- helpers -------------------------------------------------------------

    fn check_mapping_draft(
        &self,
        procedure: &str,
        draft: &MappingDraft,
    ) -> Result<(), ValidationError> {
        if draft.reference.trim().is_empty() {
            return Err(ValidationError::new(
                codes::NULL_FIELD,
                procedure,
                ["reference".to_string()],
                "reference cannot be null",
            ));
        }
        naming::check_identifier_opt(procedure, "target_schema", &draft.target_schema)?;
        naming::check_identifier(procedure, "target_table_name", &draft.target_table_name)?;
        if draft.block_process_rows < 0 {
            return Err(ValidationError::new(
                codes::NULL_FIELD,
                procedure,
                ["block_process_rows".to_string()],
                "block_process_rows must be >= 0",
            ));
        }
        if let Some(column) = &draft.checkpoint.column {
            naming::check_identifier(procedure, "checkpoint_column", column)?;
        }
        Ok(())
    }

    async fn require_mapping(
        &self,
        procedure: &str,
        reference: &str,
    ) -> Result<Mapping, CompilerError> {
        match mappings::current(&self.store, reference).await? {
            Some(m) => Ok(m),
            None => {
                let e = ValidationError::new(
                    codes::NULL_FIELD,
                    procedure,
                    [reference.to_string()],
                    format!("Mapping {reference} does not exist"),
                );
                Err(self.reject(Some(reference), e).await)
            }
        }
    }

    async fn resolve_logic(
        &self,
        procedure: &str,
        logic: &MapLogic,
    ) -> Result<String, CompilerError> {
        match logic {
            MapLogic::Sql(sql) => Ok(sql.clone()),
            MapLogic::Snippet(code) => match snippets::current(&self.store, code).await? {
                Some(snippet) => Ok(snippet.body),
                None => Err(CompilerError::Validation(ValidationError::new(
                    codes::LOGIC_INVALID,
                    procedure,
                    [code.clone()],
                    format!("SQL snippet {code} does not exist"),
                ))),
            },
        }
    }

    /// Persist the rejection (best effort) and hand it back as the error.
    async fn reject(&self, reference: Option<&str>, error: ValidationError) -> CompilerError {
        if let Err(persist_err) = error_records::insert(
            &self.store,
            &self.ids,
            reference,
            error.code,
            &error.procedure,
            &error.params,
            &error.message,
        )
        .await
        {
            warn!(error = %persist_err, "could not persist validation error");
        }
        CompilerError::Validation(error)
    }
}

/// Frequency / day / time-of-day / window rules for a schedule.
pub fn check_schedule_draft(
    procedure: &str,
    draft: &ScheduleDraft,
) -> Result<(), ValidationError> {
    if draft.hour_of_day > 23 || draft.minute_of_hour > 59 {
        return Err(ValidationError::new(
            codes::FREQUENCY_INVALID,
            procedure,
            [
                draft.hour_of_day.to_string(),
                draft.minute_of_hour.to_string(),
            ],
            "hour must be 0-23 and minute 0-59",
        ));
    }
    let day = draft.frequency_day.as_deref();
    match draft.frequency_code {
        FrequencyCode::Weekly => {
            if day.and_then(parse_weekday).is_none() {
                return Err(ValidationError::new(
                    codes::FREQUENCY_INVALID,
                    procedure,
                    day.map(str::to_string),
                    "weekly schedules need a weekday MON..SUN",
                ));
            }
        }
        FrequencyCode::Monthly | FrequencyCode::HalfYearly | FrequencyCode::Yearly => {
            let dom = day.and_then(|d| d.parse::<u32>().ok());
            if !matches!(dom, Some(1..=31)) {
                return Err(ValidationError::new(
                    codes::FREQUENCY_INVALID,
                    procedure,
                    day.map(str::to_string),
                    "day-of-month must be 1-31",
                ));
            }
        }
        FrequencyCode::Interval => {
            let minutes = day.and_then(|d| d.parse::<i64>().ok());
            if !matches!(minutes, Some(m) if m >= 1) {
                return Err(ValidationError::new(
                    codes::FREQUENCY_INVALID,
                    procedure,
                    day.map(str::to_string),
                    "interval schedules need a minute count >= 1",
                ));
            }
        }
        FrequencyCode::None | FrequencyCode::Daily | FrequencyCode::Fortnightly => {}
    }
    if let Some(end) = draft.end_date {
        if end <= draft.start_date {
            return Err(ValidationError::new(
                codes::SCHEDULE_DATES_INVALID,
                procedure,
                [draft.start_date.to_string(), end.to_string()],
                "end_date must be after start_date",
            ));
        }
    }
    Ok(())
}
