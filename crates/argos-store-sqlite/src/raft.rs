//! Consensus persistence: [`RaftStorage`] for [`SqliteStore`].
//!
//! Every log entry carries a SHA-256 checksum over its index, term and
//! payload, re-checked by [`RaftStorage::verify`] when the node starts.

use argos_raft::{
  HardState, LogEntry, LogId, NodeId,
  storage::{LogIntegrity, RaftStorage, check_sequence},
};
use rusqlite::OptionalExtension as _;
use tracing::warn;

use crate::{Result, encode::LogRow, error::Error, store::SqliteStore};

impl SqliteStore {
  async fn log_rows(&self, from: u64, to: u64) -> Result<Vec<LogRow>> {
    if from > to {
      return Ok(Vec::new());
    }
    let (from, to) = (from as i64, to.min(i64::MAX as u64) as i64);
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT log_index, term, payload_json, checksum FROM raft_log
           WHERE log_index >= ?1 AND log_index <= ?2
           ORDER BY log_index",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![from, to], LogRow::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }
}

impl RaftStorage for SqliteStore {
  type Error = Error;

  async fn hard_state(&self) -> Result<HardState> {
    let row: Option<(i64, Option<i64>)> = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .query_row(
              "SELECT current_term, voted_for FROM raft_state WHERE id = 1",
              [],
              |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;

    Ok(match row {
      Some((term, voted_for)) => HardState {
        current_term: term as u64,
        voted_for:    voted_for.map(|v| v as NodeId),
      },
      None => HardState::default(),
    })
  }

  async fn save_hard_state(&self, state: HardState) -> Result<()> {
    let term = state.current_term as i64;
    let voted_for = state.voted_for.map(|v| v as i64);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO raft_state (id, current_term, voted_for) VALUES (1, ?1, ?2)
           ON CONFLICT (id) DO UPDATE SET
             current_term = excluded.current_term,
             voted_for = excluded.voted_for",
          rusqlite::params![term, voted_for],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn last_log_id(&self) -> Result<LogId> {
    let last: Option<(i64, i64)> = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .query_row(
              "SELECT log_index, term FROM raft_log ORDER BY log_index DESC LIMIT 1",
              [],
              |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(last.map_or(LogId::default(), |(index, term)| LogId::new(index as u64, term as u64)))
  }

  async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
    self.log_rows(from, to).await?.into_iter().map(LogRow::into_entry).collect()
  }

  async fn first_index_in_term(&self, term: u64, at_or_before: u64) -> Result<u64> {
    let (term, upto) = (term as i64, at_or_before as i64);
    let first: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT MIN(log_index) FROM raft_log WHERE term = ?1 AND log_index <= ?2",
          rusqlite::params![term, upto],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(first.map_or(at_or_before, |index| index as u64))
  }

  async fn append(&self, entries: Vec<LogEntry>) -> Result<()> {
    let Some(first) = entries.first().map(|e| e.index as i64) else { return Ok(()) };
    let rows = entries.iter().map(LogRow::encode).collect::<Result<Vec<_>>>()?;

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM raft_log WHERE log_index >= ?1", rusqlite::params![first])?;
        {
          let mut stmt = tx.prepare_cached(
            "INSERT INTO raft_log (log_index, term, payload_json, checksum)
             VALUES (?1, ?2, ?3, ?4)",
          )?;
          for row in &rows {
            stmt.execute(rusqlite::params![row.log_index, row.term, row.payload_json, row.checksum])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn reset_log(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute("DELETE FROM raft_log", [])?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn verify(&self) -> Result<LogIntegrity> {
    let hard = self.hard_state().await?;
    let rows = self.log_rows(1, u64::MAX).await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
      let index = row.log_index as u64;
      if !row.checksum_matches() {
        warn!(index, "raft log checksum mismatch");
        return Ok(LogIntegrity::Corrupt { index, reason: "checksum mismatch".into() });
      }
      match row.into_entry() {
        Ok(entry) => entries.push(entry),
        Err(err) => {
          return Ok(LogIntegrity::Corrupt { index, reason: format!("undecodable payload: {err}") });
        }
      }
    }
    Ok(check_sequence(hard.current_term, &entries))
  }
}
