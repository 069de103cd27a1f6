use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DbError;
use crate::lock::DbObjectLock;
use crate::session::{Session, SessionStatus};

/// What a replicated write ran into on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictType {
    #[default]
    None,
    RowLock,
    DbObjectLock,
    Append,
}

impl ConflictType {
    pub fn code(self) -> u8 {
        match self {
            ConflictType::None => 0,
            ConflictType::RowLock => 1,
            ConflictType::DbObjectLock => 2,
            ConflictType::Append => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<ConflictType> {
        match code {
            0 => Some(ConflictType::None),
            1 => Some(ConflictType::RowLock),
            2 => Some(ConflictType::DbObjectLock),
            3 => Some(ConflictType::Append),
            _ => None,
        }
    }
}

/// Ack emitted for each replicated update. `first` carries the append start
/// key (else -1); `ack_version` lets replicas deduplicate retry
/// notifications for the same statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationUpdateAck {
    pub update_count: i32,
    pub first: i64,
    pub uncommitted_replication_name: Option<String>,
    pub conflict_type: ConflictType,
    pub ack_version: i32,
    pub if_ddl: bool,
    pub final_result: bool,
}

impl ReplicationUpdateAck {
    pub fn no_conflict(update_count: i32, ack_version: i32, if_ddl: bool, final_result: bool) -> Self {
        ReplicationUpdateAck {
            update_count,
            first: -1,
            uncommitted_replication_name: None,
            conflict_type: ConflictType::None,
            ack_version,
            if_ddl,
            final_result,
        }
    }
}

/// Phase bits carried by the `Prepared` ack variants: one per step of a
/// two-phase replicated commit.
pub const PHASE_PREPARE: u8 = 1;
pub const PHASE_COMMIT: u8 = 2;

/// The concrete packet shape an ack travels in. The `Dt` variants carry the
/// same payload inside a distributed-transaction envelope and are selected
/// iff the emitting session is a non-root participant with auto-commit off;
/// `Prepared` variants add the two-phase replication phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationAckPacket {
    Update(ReplicationUpdateAck),
    DtUpdate(ReplicationUpdateAck),
    PreparedUpdate { ack: ReplicationUpdateAck, phase: u8 },
    DtPreparedUpdate { ack: ReplicationUpdateAck, phase: u8 },
}

impl ReplicationAckPacket {
    pub fn update(is_root: bool, auto_commit: bool, ack: ReplicationUpdateAck) -> Self {
        if !is_root && !auto_commit {
            ReplicationAckPacket::DtUpdate(ack)
        } else {
            ReplicationAckPacket::Update(ack)
        }
    }

    pub fn prepared(is_root: bool, auto_commit: bool, ack: ReplicationUpdateAck, phase: u8) -> Self {
        if !is_root && !auto_commit {
            ReplicationAckPacket::DtPreparedUpdate { ack, phase }
        } else {
            ReplicationAckPacket::PreparedUpdate { ack, phase }
        }
    }

    pub fn ack(&self) -> &ReplicationUpdateAck {
        match self {
            ReplicationAckPacket::Update(ack) | ReplicationAckPacket::DtUpdate(ack) => ack,
            ReplicationAckPacket::PreparedUpdate { ack, .. }
            | ReplicationAckPacket::DtPreparedUpdate { ack, .. } => ack,
        }
    }
}

/// Encodes one APPEND retry entry: `<first>,<count>:<replicationName>`.
pub fn format_retry_entry(first: i64, count: i64, replication_name: &str) -> String {
    format!("{first},{count}:{replication_name}")
}

pub fn parse_retry_entry(entry: &str) -> Result<(i64, i64, String), DbError> {
    let (range, name) = entry
        .split_once(':')
        .ok_or_else(|| DbError::InvalidValue(format!("retry entry: {entry}")))?;
    let (first, count) = range
        .split_once(',')
        .ok_or_else(|| DbError::InvalidValue(format!("retry entry: {entry}")))?;
    let first = first
        .parse::<i64>()
        .map_err(|_| DbError::InvalidValue(format!("retry entry start key: {entry}")))?;
    let count = count
        .parse::<i64>()
        .map_err(|_| DbError::InvalidValue(format!("retry entry count: {entry}")))?;
    if name.is_empty() || count < 0 {
        return Err(DbError::InvalidValue(format!("retry entry: {entry}")));
    }
    Ok((first, count, name.to_string()))
}

/// The deterministic outcome of an APPEND negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResolution {
    pub min_key: i64,
    pub max_key: i64,
    pub assignments: HashMap<String, i64>,
}

/// Derives the key-range assignment every replica must agree on. The input
/// order does not matter: entries are ordered by (start key, name) before
/// ranges are dealt out, so any permutation yields the same table.
pub fn resolve_append_ranges(entries: &[String]) -> Result<AppendResolution, DbError> {
    let mut parsed = entries
        .iter()
        .map(|e| parse_retry_entry(e))
        .collect::<Result<Vec<_>, _>>()?;
    if parsed.is_empty() {
        return Err(DbError::InvalidValue("empty retry list".to_string()));
    }
    parsed.sort_by(|a, b| (a.0, &a.2).cmp(&(b.0, &b.2)));

    let min_key = parsed[0].0;
    let mut next = min_key;
    let mut assignments = HashMap::with_capacity(parsed.len());
    for (_, count, name) in parsed {
        assignments.insert(name, next);
        next += count;
    }
    Ok(AppendResolution {
        min_key,
        max_key: next,
        assignments,
    })
}

/// First name in the list wins a row- or object-lock conflict, on every
/// replica alike.
pub fn winning_replication_name(retry_names: &[String]) -> Option<&str> {
    retry_names.first().map(String::as_str)
}

/// The pending conflict a session recorded while executing a replicated
/// write, consumed by the retry negotiation.
#[derive(Debug, Clone)]
pub enum ReplicationConflict {
    RowLock {
        map: String,
        key: i64,
        holder_session: u64,
    },
    DbObjectLock {
        lock: Arc<DbObjectLock>,
    },
    Append {
        map: String,
        start_key: i64,
        count: i64,
        holder_session: Option<u64>,
    },
}

impl ReplicationConflict {
    pub fn conflict_type(&self) -> ConflictType {
        match self {
            ReplicationConflict::RowLock { .. } => ConflictType::RowLock,
            ReplicationConflict::DbObjectLock { .. } => ConflictType::DbObjectLock,
            ReplicationConflict::Append { .. } => ConflictType::Append,
        }
    }
}

impl Session {
    /// Negotiates a replica write conflict from inside the winning-candidate
    /// session. All replicas run the same negotiation over the same retry
    /// list and reach the same outcome.
    pub fn handle_replica_conflict(
        self: &Arc<Self>,
        mut retry_names: Vec<String>,
    ) -> Result<(), DbError> {
        let conflict = self.take_replication_conflict();
        match conflict {
            Some(ReplicationConflict::RowLock {
                map,
                key,
                holder_session,
            }) => {
                if let Some(own) = self.replication_name() {
                    retry_names.insert(0, own);
                }
                tracing::debug!(
                    session = self.id(),
                    map,
                    key,
                    ?retry_names,
                    "row lock conflict, taking over"
                );
                // The list rides on every lock this session holds.
                self.set_retry_replication_names(retry_names);
                if let Some(holder) = self.database().find_session(holder_session) {
                    holder.yield_row_lock_to(&map, key, self);
                }
                self.clear_waits();
                self.set_status(SessionStatus::Retrying);
                self.wake();
                Ok(())
            }
            Some(ReplicationConflict::DbObjectLock { lock }) => {
                tracing::debug!(
                    session = self.id(),
                    object = ?lock.object(),
                    ?retry_names,
                    "object lock conflict, taking over"
                );
                if let Some(holder) = lock.holder() {
                    // Applies to all of the holder's locks, not only the
                    // contested one; any earlier retry list is overwritten.
                    holder.set_retry_replication_names(retry_names);
                    holder.rollback_current_command(Some(self));
                }
                self.clear_waits();
                self.set_status(SessionStatus::Retrying);
                self.wake();
                Ok(())
            }
            Some(ReplicationConflict::Append {
                map,
                holder_session,
                ..
            }) => {
                let resolution = resolve_append_ranges(&retry_names)?;
                tracing::debug!(
                    session = self.id(),
                    map,
                    min = resolution.min_key,
                    max = resolution.max_key,
                    "append conflict resolved"
                );
                let engine_map = self.database().engine().open_map(&map);
                let allocator = engine_map.append_allocator();
                allocator.set_max_key(resolution.max_key);
                allocator.publish_assignments(resolution.assignments.clone());

                if let Some(holder_session) = holder_session {
                    if let Some(holder) = self.database().find_session(holder_session) {
                        holder.rollback_current_command(None);
                        holder.set_retry_return_result();
                    }
                }
                self.rollback_current_command(None);
                self.set_retry_return_result();
                Ok(())
            }
            None => {
                tracing::trace!(session = self.id(), "no pending conflict, going idle");
                self.set_status(SessionStatus::StatementCompleted);
                self.wake();
                Ok(())
            }
        }
    }
}
