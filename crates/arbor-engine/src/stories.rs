//! Story record access
//!
//! The story record belongs to the story service; the engine reads its
//! status, appends branch ids and retags content units on merge.

use crate::context::EngineContext;
use crate::error::{BranchError, Entity, Result};
use crate::keys;
use crate::types::{Branch, Sentence, Story};
use crate::types::new_id;

/// Read/write view of story records
#[derive(Debug, Clone)]
pub struct StoryRecords {
    ctx: EngineContext,
}

impl StoryRecords {
    /// Create over a shared context
    #[inline]
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Load a story
    ///
    /// # Errors
    /// Returns error if the store fails or the record is malformed
    pub async fn get_story(&self, story_id: &str) -> Result<Option<Story>> {
        Ok(self.ctx.records.load(&keys::story(story_id)).await?)
    }

    /// Write a story record as-is
    ///
    /// # Errors
    /// Returns `Validation` for ids the key layout cannot address, or a store error
    pub async fn put_story(&self, story: &Story) -> Result<()> {
        if story.id.is_empty() || story.id.contains(':') {
            return Err(BranchError::Validation(format!(
                "story id {:?} must be non-empty and free of ':'",
                story.id
            )));
        }
        self.ctx.records.save(&keys::story(&story.id), story).await?;
        Ok(())
    }

    /// Append a content unit to a story, optionally on a branch
    ///
    /// # Errors
    /// - `Validation` if the text is blank
    /// - `NotFound` if the story, or the named branch within it, does not exist
    pub async fn append_sentence(
        &self,
        story_id: &str,
        branch_id: Option<&str>,
        author: &str,
        text: &str,
    ) -> Result<Sentence> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BranchError::Validation("sentence text must not be empty".to_string()));
        }

        if let Some(branch_id) = branch_id {
            let branch: Option<Branch> = self.ctx.records.load(&keys::branch(branch_id)).await?;
            if !branch.is_some_and(|b| b.story_id == story_id) {
                return Err(BranchError::not_found(Entity::Branch, branch_id));
            }
        }

        let sentence = Sentence {
            id: new_id("sentence"),
            text: text.to_string(),
            author: author.to_string(),
            branch_id: branch_id.map(str::to_string),
            created_at: self.ctx.now(),
            merged_from: None,
            merged_at: None,
        };

        let appended = sentence.clone();
        self.ctx
            .records
            .update(&keys::story(story_id), move |story: &mut Story| -> Result<()> {
                story.sentences.push(appended.clone());
                Ok(())
            })
            .await?
            .ok_or_else(|| BranchError::not_found(Entity::Story, story_id))?;

        Ok(sentence)
    }

    /// Ids of every stored story
    ///
    /// # Errors
    /// Returns error if the prefix scan fails
    pub async fn list_story_ids(&self) -> Result<Vec<String>> {
        let keys = self.ctx.store().keys_by_prefix(keys::STORY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| keys::story_id_from_key(k))
            .map(str::to_string)
            .collect())
    }
}
