use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{MemorySystem, from_millis, to_millis};
use crate::core::scheduler::job::{Job, Trigger};

type RawJob = (String, String, String, String, i64, Option<i64>, bool, i64);

const JOB_COLUMNS: &str =
    "id, conversation_id, trigger_spec, payload, next_fire_at, last_fired_at, enabled, created_at";

fn read_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_job(
    (id, conversation_id, trigger, payload, next_fire_at, last_fired_at, enabled, created_at): RawJob,
) -> Result<Job> {
    let trigger: Trigger = serde_json::from_str(&trigger)?;
    Ok(Job {
        id,
        conversation_id,
        trigger,
        payload,
        next_fire_at: from_millis(next_fire_at)?,
        last_fired_at: last_fired_at.map(from_millis).transpose()?,
        enabled,
        created_at: from_millis(created_at)?,
    })
}

impl MemorySystem {
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            &format!("INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", JOB_COLUMNS),
            params![
                job.id,
                job.conversation_id,
                serde_json::to_string(&job.trigger)?,
                job.payload,
                to_millis(job.next_fire_at),
                job.last_fired_at.map(to_millis),
                job.enabled,
                to_millis(job.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                read_job,
            )
            .optional()?;
        raw.map(into_job).transpose()
    }

    /// All jobs, or only one conversation's, soonest first.
    pub async fn list_jobs(&self, conversation_id: Option<&str>) -> Result<Vec<Job>> {
        let db = self.db.lock().await;
        let mut raws = Vec::new();
        match conversation_id {
            Some(conv) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM jobs WHERE conversation_id = ?1 ORDER BY next_fire_at ASC, created_at ASC",
                    JOB_COLUMNS
                ))?;
                for row in stmt.query_map(params![conv], read_job)? {
                    raws.push(row?);
                }
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM jobs ORDER BY next_fire_at ASC, created_at ASC",
                    JOB_COLUMNS
                ))?;
                for row in stmt.query_map([], read_job)? {
                    raws.push(row?);
                }
            }
        }
        raws.into_iter().map(into_job).collect()
    }

    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE enabled = 1 AND next_fire_at <= ?1 \
             ORDER BY next_fire_at ASC, created_at ASC",
            JOB_COLUMNS
        ))?;
        let mut raws = Vec::new();
        for row in stmt.query_map(params![to_millis(now)], read_job)? {
            raws.push(row?);
        }
        raws.into_iter().map(into_job).collect()
    }

    pub async fn earliest_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().await;
        let ms: Option<i64> = db.query_row(
            "SELECT MIN(next_fire_at) FROM jobs WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        ms.map(from_millis).transpose()
    }

    /// Record a fire: the job is rescheduled and `last_fired_at` advanced.
    pub async fn record_job_fire(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE jobs SET last_fired_at = ?2, next_fire_at = ?3 WHERE id = ?1",
            params![id, to_millis(fired_at), to_millis(next_fire_at)],
        )?;
        Ok(updated > 0)
    }

    pub async fn reschedule_job(&self, id: &str, next_fire_at: DateTime<Utc>) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE jobs SET next_fire_at = ?2 WHERE id = ?1",
            params![id, to_millis(next_fire_at)],
        )?;
        Ok(updated > 0)
    }

    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(rows_deleted > 0)
    }

    /// Scoped to one conversation when given, else every job.
    pub async fn delete_jobs(&self, conversation_id: Option<&str>) -> Result<usize> {
        let db = self.db.lock().await;
        let rows_deleted = match conversation_id {
            Some(conv) => db.execute("DELETE FROM jobs WHERE conversation_id = ?1", params![conv])?,
            None => db.execute("DELETE FROM jobs", [])?,
        };
        Ok(rows_deleted)
    }
}
