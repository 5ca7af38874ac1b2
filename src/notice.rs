// src/notice.rs

//! Repository notice boards
//!
//! Notices live in a repository store next to the packages and travel to
//! clients with every update. Each client remembers the highest notice id
//! it has read per repository in the system database.

use crate::context::RepositoryContext;
use crate::db;
use crate::db::models::{Notice, NoticeMark, StoreMetadata};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use tracing::info;

pub struct NoticeBoard<'a> {
    ctx: &'a RepositoryContext,
    repository: String,
}

impl<'a> NoticeBoard<'a> {
    pub fn new(ctx: &'a RepositoryContext, repository: &str) -> Self {
        Self {
            ctx,
            repository: repository.to_string(),
        }
    }

    /// Post a notice; returns its id
    pub fn add(&self, title: &str, body: &str, link: Option<&str>, mode: LockMode) -> Result<i64> {
        if title.trim().is_empty() {
            return Err(Error::ParseError("Notice title cannot be empty".to_string()));
        }

        let _guard = self.ctx.locks().exclusive(&self.repository, mode)?;
        let mut conn = self.ctx.open_current_store(&self.repository)?;
        let id = db::transaction(&mut conn, |tx| {
            let mut notice = Notice::new(
                title.to_string(),
                body.to_string(),
                link.map(str::to_string),
            );
            let id = notice.insert(tx)?;
            // Local content no longer matches any published checksum
            StoreMetadata::remove(tx, StoreMetadata::CHECKSUM)?;
            Ok(id)
        })?;

        info!("Added notice {} to {}", id, self.repository);
        Ok(id)
    }

    pub fn remove(&self, id: i64, mode: LockMode) -> Result<()> {
        let _guard = self.ctx.locks().exclusive(&self.repository, mode)?;
        let mut conn = self.ctx.open_current_store(&self.repository)?;
        db::transaction(&mut conn, |tx| {
            if !Notice::delete(tx, id)? {
                return Err(Error::NotFoundError(format!(
                    "Notice {} not found in {}",
                    id, self.repository
                )));
            }
            StoreMetadata::remove(tx, StoreMetadata::CHECKSUM)
        })?;

        info!("Removed notice {} from {}", id, self.repository);
        Ok(())
    }

    /// All notices, oldest first
    pub fn show(&self, mode: LockMode) -> Result<Vec<Notice>> {
        let _guard = self.ctx.locks().shared(&self.repository, mode)?;
        let conn = self.ctx.open_current_store(&self.repository)?;
        Notice::list_all(&conn)
    }

    /// Notices newer than the client's high-water mark
    pub fn unread(&self, mode: LockMode) -> Result<Vec<Notice>> {
        let mark = NoticeMark::get(&self.ctx.open_system()?, &self.repository)?;
        let _guard = self.ctx.locks().shared(&self.repository, mode)?;
        let conn = self.ctx.open_current_store(&self.repository)?;
        Notice::list_after(&conn, mark)
    }

    /// Mark everything up to `id` as read; returns the resulting mark
    pub fn mark_read(&self, id: i64) -> Result<i64> {
        NoticeMark::advance(&self.ctx.open_system()?, &self.repository, id)
    }

    /// Mark every current notice as read
    pub fn mark_all_read(&self, mode: LockMode) -> Result<i64> {
        let newest = self.show(mode)?.iter().filter_map(|n| n.id).max();
        match newest {
            Some(id) => self.mark_read(id),
            None => NoticeMark::get(&self.ctx.open_system()?, &self.repository),
        }
    }
}
