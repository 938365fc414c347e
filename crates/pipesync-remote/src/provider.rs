//! [`IRemoteCrm`] implementation over the CRM HTTP API
//!
//! Decodes cursors into concrete wire requests, acquires from the shared
//! [`RateBudget`] before every call, and translates wire records into
//! field-mapped [`ChangeRecord`]s. Records the adapter cannot make sense
//! of are dropped and counted, never allowed to poison the page.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tracing::warn;

use pipesync_core::domain::cursor::{Cursor, CursorState};
use pipesync_core::domain::entity::ChangeRecord;
use pipesync_core::domain::mapping::FieldMapping;
use pipesync_core::domain::newtypes::{RemoteRecordId, SessionId};
use pipesync_core::domain::session::SessionKind;
use pipesync_core::ports::remote_crm::{ChangePage, IRemoteCrm, RecordUpdate, UpdateOutcome};

use crate::budget::RateBudget;
use crate::client::{CrmHttpClient, RemoteError, RemoteRecordDto, UpdatePayload};

/// The remote's hard ceiling on records per batch update call
pub const PUSH_BATCH_CEILING: usize = 100;

/// Production adapter for the remote CRM port
pub struct CrmProvider {
    client: CrmHttpClient,
    budget: Arc<RateBudget>,
    mapping: FieldMapping,
    /// Records requested per page
    page_size: u32,
    /// How long a call may wait for rate budget
    acquire_timeout: Duration,
}

impl CrmProvider {
    pub fn new(
        client: CrmHttpClient,
        budget: Arc<RateBudget>,
        mapping: FieldMapping,
        page_size: u32,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            client,
            budget,
            mapping,
            page_size,
            acquire_timeout,
        }
    }

    /// Translates one wire record, or `None` if it is malformed
    fn translate(&self, dto: RemoteRecordDto, session_id: SessionId) -> Option<ChangeRecord> {
        let remote_id = match RemoteRecordId::new(dto.id.clone()) {
            Ok(id) => id,
            Err(e) => {
                warn!(raw_id = %dto.id, error = %e, "dropping record with malformed id");
                return None;
            }
        };
        Some(ChangeRecord {
            remote_id,
            payload: self.mapping.apply(&dto.fields),
            remote_modified_at: dto.modified_at,
            deleted: dto.deleted,
            session_id,
        })
    }

    /// Cursor for the page after the one just fetched
    fn advance_cursor(state: &CursorState, records: &[ChangeRecord]) -> Cursor {
        match state {
            CursorState::Full { offset } => CursorState::Full {
                offset: offset + records.len() as u64,
            }
            .encode(),
            CursorState::Incremental { watermark, after_id } => match records.last() {
                Some(last) => CursorState::Incremental {
                    watermark: last.remote_modified_at,
                    after_id: Some(last.remote_id.clone()),
                }
                .encode(),
                None => CursorState::Incremental {
                    watermark: *watermark,
                    after_id: after_id.clone(),
                }
                .encode(),
            },
        }
    }
}

#[async_trait]
impl IRemoteCrm for CrmProvider {
    #[tracing::instrument(skip(self))]
    async fn fetch_page(
        &self,
        session_id: SessionId,
        kind: SessionKind,
        cursor: &Cursor,
    ) -> anyhow::Result<ChangePage> {
        let state = cursor.decode().context("decoding fetch cursor")?;
        match (&state, kind) {
            (CursorState::Full { .. }, SessionKind::Full)
            | (CursorState::Incremental { .. }, SessionKind::Incremental) => {}
            _ => anyhow::bail!("cursor kind does not match session kind {kind:?}"),
        }

        self.budget.acquire(1, self.acquire_timeout).await?;

        let page = match &state {
            CursorState::Full { offset } => {
                self.client.fetch_full_page(*offset, self.page_size).await?
            }
            CursorState::Incremental { watermark, after_id } => {
                self.client
                    .fetch_changes_page(
                        *watermark,
                        after_id.as_ref().map(RemoteRecordId::as_str),
                        self.page_size,
                    )
                    .await?
            }
        };

        let fetched = page.records.len() as u64;
        let records: Vec<ChangeRecord> = page
            .records
            .into_iter()
            .filter_map(|dto| self.translate(dto, session_id))
            .collect();
        let malformed = fetched - records.len() as u64;

        Ok(ChangePage {
            next_cursor: Self::advance_cursor(&state, &records),
            records,
            has_more: page.has_more,
            records_total: page.total,
            malformed,
        })
    }

    async fn validate_cursor(&self, cursor: &Cursor) -> anyhow::Result<bool> {
        let state = match cursor.decode() {
            Ok(state) => state,
            // A token we cannot decode is never honored
            Err(_) => return Ok(false),
        };

        match state {
            // Offset cursors are local constructs; the remote accepts any offset
            CursorState::Full { .. } => Ok(true),
            CursorState::Incremental { watermark, after_id } => {
                self.budget.acquire(1, self.acquire_timeout).await?;
                match self
                    .client
                    .fetch_changes_page(watermark, after_id.as_ref().map(RemoteRecordId::as_str), 1)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(RemoteError::CursorExpired) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    #[tracing::instrument(skip(self, updates))]
    async fn update_records(&self, updates: &[RecordUpdate]) -> anyhow::Result<Vec<UpdateOutcome>> {
        anyhow::ensure!(
            updates.len() <= PUSH_BATCH_CEILING,
            "batch of {} exceeds the remote's ceiling of {PUSH_BATCH_CEILING}",
            updates.len()
        );
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        self.budget.acquire(1, self.acquire_timeout).await?;

        // Push under the remote's own field names
        let payloads: Vec<UpdatePayload> = updates
            .iter()
            .map(|u| UpdatePayload {
                id: u.remote_id.as_str().to_string(),
                fields: u
                    .fields
                    .iter()
                    .map(|(name, value)| {
                        (self.mapping.remote_name(name).to_string(), value.clone())
                    })
                    .collect(),
            })
            .collect();

        let results = self.client.push_updates(&payloads).await?;
        results
            .into_iter()
            .map(|r| {
                Ok(UpdateOutcome {
                    remote_id: RemoteRecordId::new(r.id)
                        .context("remote returned a malformed record id")?,
                    error: r.error,
                })
            })
            .collect()
    }
}
