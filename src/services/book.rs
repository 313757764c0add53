use crate::core::repository::Repository;
use crate::core::state::{Chapter, StoryDraft, UserId};
use anyhow::Result;
use std::collections::HashMap;

const PAGES_PER_MEMORY: f32 = 0.75;

pub fn compile_chapter(chapter: &Chapter, memories: &[&StoryDraft]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut lines = vec![format!("# {}\n", chapter.title)];
    if let Some(period) = chapter.period_hint.as_deref().filter(|p| !p.is_empty()) {
        lines.push(format!("*{}*\n", period));
    }
    lines.push(String::new());

    for memory in memories {
        if let Some(title) = memory.title.as_deref().filter(|t| !t.is_empty()) {
            lines.push(format!("## {}\n", title));
        }
        lines.push(memory.primary_text().to_string());
        lines.push("\n---\n".to_string());
    }
    lines.join("\n")
}

pub fn compile_book(chapters: &[Chapter], drafts: &[StoryDraft], author_name: Option<&str>) -> String {
    let mut by_chapter: HashMap<_, Vec<&StoryDraft>> = HashMap::new();
    for draft in drafts {
        if let Some(chapter_id) = draft.chapter_id() {
            by_chapter.entry(chapter_id).or_default().push(draft);
        }
    }

    let mut ordered: Vec<&Chapter> = chapters.iter().collect();
    ordered.sort_by_key(|c| c.order_index);

    let mut lines = Vec::new();
    if let Some(name) = author_name.filter(|n| !n.is_empty()) {
        lines.push(format!("# {}\n", name));
        lines.push("## Книга воспоминаний\n\n---\n".to_string());
    }
    for chapter in ordered {
        if let Some(memories) = by_chapter.get_mut(&chapter.id) {
            memories.sort_by_key(|d| d.created_at);
            lines.push(compile_chapter(chapter, memories));
            lines.push("\n".to_string());
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookProgress {
    pub memories: usize,
    pub chapters_total: usize,
    pub chapters_filled: usize,
    pub estimated_pages: f32,
}

pub async fn book_progress(repo: &dyn Repository, user_id: UserId) -> Result<BookProgress> {
    let chapters = repo.list_chapters(user_id).await?;
    let approved: Vec<StoryDraft> = repo.list_drafts(user_id).await?.into_iter().filter(|d| d.approved()).collect();
    let chapters_filled = chapters
        .iter()
        .filter(|c| approved.iter().any(|d| d.chapter_id() == Some(c.id)))
        .count();
    Ok(BookProgress {
        memories: approved.len(),
        chapters_total: chapters.len(),
        chapters_filled,
        estimated_pages: approved.len() as f32 * PAGES_PER_MEMORY,
    })
}

pub async fn export_book(repo: &dyn Repository, user_id: UserId) -> Result<String> {
    let chapters = repo.list_chapters(user_id).await?;
    let drafts = repo.list_drafts(user_id).await?;
    let author = repo.get_user(user_id).await?.and_then(|p| p.display_name);
    Ok(compile_book(&chapters, &drafts, author.as_deref()))
}
