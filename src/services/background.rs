use crate::core::repository::Repository;
use crate::core::state::{ChapterId, UserId};
use crate::services::context::ContextAccumulator;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FAILURE_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum ContextJob {
    Style { user_id: UserId, text: String },
    Characters { user_id: UserId, text: String },
    ChapterSummary { user_id: UserId, chapter_id: ChapterId, text: String },
}

impl ContextJob {
    pub fn for_approved_story(user_id: UserId, chapter_id: ChapterId, text: &str) -> Vec<ContextJob> {
        vec![
            ContextJob::Style { user_id, text: text.to_string() },
            ContextJob::Characters { user_id, text: text.to_string() },
            ContextJob::ChapterSummary { user_id, chapter_id, text: text.to_string() },
        ]
    }

    fn name(&self) -> &'static str {
        match self {
            ContextJob::Style { .. } => "style",
            ContextJob::Characters { .. } => "characters",
            ContextJob::ChapterSummary { .. } => "chapter_summary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job: &'static str,
    pub user_id: UserId,
    pub error: String,
    pub at: DateTime<Utc>,
}

type FailureLog = Arc<Mutex<VecDeque<JobFailure>>>;

pub struct ContextJobQueue {
    sender: Option<mpsc::UnboundedSender<ContextJob>>,
    worker: Option<JoinHandle<()>>,
    failures: FailureLog,
}

impl ContextJobQueue {
    pub fn spawn(repo: Arc<dyn Repository>, accumulator: ContextAccumulator) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ContextJob>();
        let failures: FailureLog = Arc::new(Mutex::new(VecDeque::new()));
        let sink = failures.clone();

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let name = job.name();
                let user_id = job_user(&job);
                debug!("Running {} job for user {}", name, user_id);
                if let Err(e) = run_job(repo.as_ref(), &accumulator, job).await {
                    error!("Context job {} for user {} failed: {:#}", name, user_id, e);
                    record_failure(&sink, JobFailure { job: name, user_id, error: format!("{:#}", e), at: Utc::now() });
                }
            }
            info!("Context job worker stopped");
        });

        Self { sender: Some(sender), worker: Some(worker), failures }
    }

    pub fn enqueue(&self, job: ContextJob) {
        let Some(sender) = &self.sender else {
            error!("Context job {} dropped: queue is shut down", job.name());
            return;
        };
        if let Err(e) = sender.send(job) {
            error!("Context job {} dropped: worker is gone", e.0.name());
        }
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        match self.failures.lock() {
            Ok(log) => log.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub async fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Context job worker panicked: {}", e);
            }
        }
    }
}

fn job_user(job: &ContextJob) -> UserId {
    match job {
        ContextJob::Style { user_id, .. }
        | ContextJob::Characters { user_id, .. }
        | ContextJob::ChapterSummary { user_id, .. } => *user_id,
    }
}

fn record_failure(sink: &FailureLog, failure: JobFailure) {
    let mut log = match sink.lock() {
        Ok(log) => log,
        Err(poisoned) => poisoned.into_inner(),
    };
    if log.len() == FAILURE_LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(failure);
}

async fn run_job(repo: &dyn Repository, accumulator: &ContextAccumulator, job: ContextJob) -> Result<()> {
    match job {
        ContextJob::Style { user_id, text } => {
            let profile = repo.get_user(user_id).await?.context("author profile missing")?;
            if let Some(style) = accumulator.refresh_style(profile.style_profile.as_deref(), &text).await {
                repo.update_style_profile(user_id, style).await?;
            }
        }
        ContextJob::Characters { user_id, text } => {
            let known = repo.list_characters(user_id).await?;
            let mentions = accumulator.refresh_characters(&known, &text).await;
            if !mentions.is_empty() {
                let touched = repo.upsert_characters(user_id, mentions).await?;
                debug!("Registry updated with {} characters", touched.len());
            }
        }
        ContextJob::ChapterSummary { user_id, chapter_id, text } => {
            let chapter = repo.get_chapter(user_id, chapter_id).await?.context("chapter missing")?;
            if let Some(summary) = accumulator
                .refresh_chapter_summary(&chapter.title, chapter.thread_summary.as_deref(), &text)
                .await
            {
                repo.update_thread_summary(user_id, chapter_id, summary).await?;
            }
        }
    }
    Ok(())
}
