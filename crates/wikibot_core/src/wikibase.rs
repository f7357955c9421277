//! Wikibase entity actions (`wbgetentities`, `wbeditentity`, `wbremoveclaims`)
//! and the statement-ID conversions the removal jobs depend on.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ErrorKind, GuidError, api_error_code, classify_error};
use crate::page::{MemberBatch, NS_LEXEME, NS_MAIN, PageContent, SaveOptions, SaveOutcome, WikiPageApi};
use crate::session::WikiSession;
use crate::transport::{HttpMethod, Transport};

/// Entity IDs per `wbgetentities` request and GUIDs per `wbremoveclaims` request.
pub const ENTITY_BATCH_SIZE: usize = 50;

/// Top-level keys `wbeditentity` accepts in its `data` document.
pub const EDITABLE_ENTITY_KEYS: &[&str] = &[
    "labels",
    "descriptions",
    "aliases",
    "claims",
    "sitelinks",
    "lemmas",
    "lexicalCategory",
    "language",
    "senses",
    "forms",
];

static STATEMENT_LOCAL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([QPLM][1-9][0-9]*(?:-[FS][1-9][0-9]*)?)-([0-9A-Fa-f]{8}-[0-9A-Fa-f-]+)$")
        .expect("statement id pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityAction {
    GetEntities,
    EditEntity,
    RemoveClaims,
}

impl EntityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetEntities => "wbgetentities",
            Self::EditEntity => "wbeditentity",
            Self::RemoveClaims => "wbremoveclaims",
        }
    }
}

/// Parsed result of an entity action; `raw` keeps the full response.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityResult {
    pub entity: Option<Value>,
    pub last_revision_id: Option<i64>,
    pub raw: Value,
}

impl EntityResult {
    fn from_response(action: EntityAction, entity_id: &str, raw: Value) -> Self {
        let entity = match action {
            EntityAction::GetEntities => raw
                .get("entities")
                .and_then(|entities| entities.get(entity_id))
                .filter(|entity| entity.get("missing").is_none())
                .cloned(),
            EntityAction::EditEntity => raw.get("entity").cloned(),
            EntityAction::RemoveClaims => None,
        };
        let last_revision_id = entity
            .as_ref()
            .and_then(|entity| entity.get("lastrevid"))
            .or_else(|| raw.pointer("/pageinfo/lastrevid"))
            .and_then(Value::as_i64);
        Self {
            entity,
            last_revision_id,
            raw,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClaimRemovalReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Convert a statement IRI as returned by the query service
/// (`http://www.wikidata.org/entity/statement/Q42-54AEEF4F-...`) into the
/// GUID the API expects (`Q42$54AEEF4F-...`).
///
/// Input that is already a GUID is rejected.
pub fn statement_iri_to_guid(statement_iri: &str) -> Result<String, GuidError> {
    let invalid = || GuidError(statement_iri.to_string());
    let (_, local) = statement_iri
        .split_once("/entity/statement/")
        .ok_or_else(invalid)?;
    let local = local.split(['?', '#']).next().unwrap_or_default();
    let captures = STATEMENT_LOCAL_ID.captures(local).ok_or_else(invalid)?;
    Ok(format!("{}${}", &captures[1], &captures[2]))
}

/// Entity part of a statement GUID (`Q42` for `Q42$...`).
pub fn guid_entity_id(guid: &str) -> Option<&str> {
    guid.split_once('$')
        .map(|(entity, _)| entity)
        .filter(|entity| !entity.is_empty())
}

/// Namespace a Wikibase entity page usually lives in.
pub fn entity_namespace(entity_id: &str) -> i32 {
    match entity_id.chars().next() {
        Some('L') => NS_LEXEME,
        Some('P') => 120,
        _ => NS_MAIN,
    }
}

/// Keep only the parts of an entity document that `wbeditentity` may change.
pub fn editable_entity_data(entity: &Value) -> Value {
    let mut data = Map::new();
    if let Some(object) = entity.as_object() {
        for key in EDITABLE_ENTITY_KEYS {
            if let Some(value) = object.get(*key) {
                data.insert((*key).to_string(), value.clone());
            }
        }
    }
    Value::Object(data)
}

impl<T: Transport> WikiSession<T> {
    pub fn call_entity_action(
        &mut self,
        action: EntityAction,
        entity_id: &str,
        data: Option<&Value>,
        params: &[(&str, String)],
    ) -> Result<EntityResult> {
        let raw = match action {
            EntityAction::GetEntities => {
                let mut query = vec![("ids", entity_id.to_string())];
                query.extend_from_slice(params);
                self.client_mut()
                    .call(action.as_str(), &query, HttpMethod::Get)?
            }
            EntityAction::EditEntity => {
                let data = data.ok_or_else(|| anyhow::anyhow!("wbeditentity requires data"))?;
                let mut form = vec![
                    ("id", entity_id.to_string()),
                    (
                        "data",
                        serde_json::to_string(data).context("failed to encode entity data")?,
                    ),
                ];
                form.extend_from_slice(params);
                self.call_with_token(action.as_str(), &form)?
            }
            EntityAction::RemoveClaims => {
                let guids = data
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow::anyhow!("wbremoveclaims requires a GUID array"))?
                    .iter()
                    .map(|guid| guid.as_str().unwrap_or_default().to_string())
                    .collect::<Vec<_>>();
                for guid in &guids {
                    if guid_entity_id(guid) != Some(entity_id) {
                        bail!("statement {guid} does not belong to {entity_id}");
                    }
                }
                let mut form = vec![("claim", guids.join("|"))];
                form.extend_from_slice(params);
                self.call_with_token(action.as_str(), &form)?
            }
        };
        Ok(EntityResult::from_response(action, entity_id, raw))
    }

    /// Existing entities keyed by ID; missing IDs are left out.
    pub fn get_entities(&mut self, ids: &[String]) -> Result<BTreeMap<String, Value>> {
        let mut output = BTreeMap::new();
        for batch in ids.chunks(ENTITY_BATCH_SIZE) {
            let response = self.client_mut().call(
                EntityAction::GetEntities.as_str(),
                &[("ids", batch.join("|"))],
                HttpMethod::Get,
            )?;
            let entities = response
                .get("entities")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (id, entity) in entities {
                if entity.get("missing").is_none() {
                    output.insert(id, entity);
                }
            }
        }
        Ok(output)
    }

    pub fn get_entity(&mut self, entity_id: &str) -> Result<Option<Value>> {
        Ok(self
            .call_entity_action(EntityAction::GetEntities, entity_id, None, &[])?
            .entity)
    }

    pub fn edit_entity(
        &mut self,
        entity_id: &str,
        data: &Value,
        summary: &str,
        base_revision: Option<i64>,
    ) -> Result<EntityResult> {
        let mut params = vec![("summary", summary.to_string()), ("bot", "1".to_string())];
        if let Some(revision) = base_revision {
            params.push(("baserevid", revision.to_string()));
        }
        self.call_entity_action(EntityAction::EditEntity, entity_id, Some(data), &params)
            .with_context(|| format!("failed to edit {entity_id}"))
    }

    /// Remove statements by GUID.
    ///
    /// GUIDs are grouped per entity (the API refuses mixed batches) and sent
    /// pipe-joined in chunks. If a chunk is rejected for an item-level reason,
    /// its GUIDs are retried one at a time so one bad GUID does not block the rest.
    pub fn remove_claims(&mut self, guids: &[String], summary: &str) -> Result<ClaimRemovalReport> {
        let mut by_entity: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut report = ClaimRemovalReport::default();
        for guid in guids {
            match guid_entity_id(guid) {
                Some(entity) => by_entity
                    .entry(entity.to_string())
                    .or_default()
                    .push(guid.clone()),
                None => report
                    .failed
                    .push((guid.clone(), "not a statement GUID".to_string())),
            }
        }

        let params = [("summary", summary.to_string()), ("bot", "1".to_string())];
        for (entity, entity_guids) in by_entity {
            for chunk in entity_guids.chunks(ENTITY_BATCH_SIZE) {
                match self.remove_claim_chunk(&entity, chunk, &params) {
                    Ok(()) => report.removed.extend_from_slice(chunk),
                    Err(error) if classify_error(&error) == ErrorKind::Fatal => return Err(error),
                    Err(error) if chunk.len() == 1 => {
                        report.failed.push((chunk[0].clone(), format!("{error:#}")));
                    }
                    Err(error) => {
                        warn!(
                            entity = %entity,
                            code = api_error_code(&error).unwrap_or("unknown"),
                            "batch removal rejected; retrying statements one by one"
                        );
                        for guid in chunk {
                            match self.remove_claim_chunk(&entity, std::slice::from_ref(guid), &params) {
                                Ok(()) => report.removed.push(guid.clone()),
                                Err(error) if classify_error(&error) == ErrorKind::Fatal => {
                                    return Err(error);
                                }
                                Err(error) => report.failed.push((guid.clone(), format!("{error:#}"))),
                            }
                        }
                    }
                }
            }
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "claim removal finished"
        );
        Ok(report)
    }

    fn remove_claim_chunk(
        &mut self,
        entity: &str,
        guids: &[String],
        params: &[(&str, String)],
    ) -> Result<()> {
        let data = Value::Array(guids.iter().cloned().map(Value::String).collect());
        self.call_entity_action(EntityAction::RemoveClaims, entity, Some(&data), params)
            .map(|_| ())
    }
}

/// Adapts entity reads and writes to the page API so the batch runner can
/// drive entity-in/entity-out transforms. Titles are entity IDs and bodies
/// are pretty-printed entity JSON.
pub struct EntityPages<'a, T: Transport> {
    session: &'a mut WikiSession<T>,
}

impl<'a, T: Transport> EntityPages<'a, T> {
    pub fn new(session: &'a mut WikiSession<T>) -> Self {
        Self { session }
    }
}

impl<T: Transport> WikiPageApi for EntityPages<'_, T> {
    fn get_page_text(&mut self, title: &str) -> Result<Option<PageContent>> {
        let Some(entity) = self.session.get_entity(title)? else {
            return Ok(None);
        };
        let revision_id = entity.get("lastrevid").and_then(Value::as_i64);
        let timestamp = entity
            .get("modified")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let body = serde_json::to_string_pretty(&entity).context("failed to encode entity")?;
        Ok(Some(PageContent {
            title: title.to_string(),
            namespace: entity_namespace(title),
            body,
            revision_id,
            timestamp,
        }))
    }

    fn save_page(
        &mut self,
        title: &str,
        new_text: &str,
        summary: &str,
        options: &SaveOptions,
    ) -> Result<SaveOutcome> {
        let proposed: Value = serde_json::from_str(new_text)
            .with_context(|| format!("proposed document for {title} is not JSON"))?;
        let data = editable_entity_data(&proposed);
        if options.verify_unchanged {
            if let Some(current) = self.session.get_entity(title)? {
                if editable_entity_data(&current) == data {
                    return Ok(SaveOutcome::NoChange);
                }
            }
        }
        match self
            .session
            .edit_entity(title, &data, summary, options.base_revision)
        {
            Ok(result) => Ok(SaveOutcome::Saved {
                revision_id: result.last_revision_id,
            }),
            Err(error) if classify_error(&error) == ErrorKind::Conflict => Ok(SaveOutcome::Conflict),
            Err(error) => Err(error),
        }
    }

    fn category_members_batch(
        &mut self,
        category: &str,
        namespaces: &[i32],
        continuation: Option<&str>,
    ) -> Result<MemberBatch> {
        self.session
            .category_members_batch(category, namespaces, continuation)
    }
}
