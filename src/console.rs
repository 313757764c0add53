use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{InquireError, Select, Text};
use memoir_pipeline::core::repository::Repository;
use memoir_pipeline::services::book::{book_progress, export_book};
use memoir_pipeline::services::workflow::{ActionOption, ConversationState, Inbound, UserAction, UserContext, WorkflowManager};
use std::fmt;
use std::path::Path;
use std::time::Duration;

enum Choice {
    Action(ActionOption),
    Write,
    Voice,
    Progress,
    Export,
    Quit,
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Action(option) => write!(f, "{}", option.label),
            Choice::Write => write!(f, "✍️ Написать текстом"),
            Choice::Voice => write!(f, "🎙 Отправить аудиофайл"),
            Choice::Progress => write!(f, "📊 Прогресс книги"),
            Choice::Export => write!(f, "📚 Собрать книгу"),
            Choice::Quit => write!(f, "🚪 Выход"),
        }
    }
}

fn menu(options: &[ActionOption]) -> Vec<Choice> {
    let mut choices: Vec<Choice> = options.iter().cloned().map(Choice::Action).collect();
    choices.extend([Choice::Write, Choice::Voice, Choice::Progress, Choice::Export, Choice::Quit]);
    choices
}

fn prompt_label(state: &ConversationState) -> &'static str {
    match state {
        ConversationState::AwaitingCorrection { .. } => "Что исправить?",
        ConversationState::AwaitingChapterTitle { .. } => "Название главы:",
        ConversationState::AwaitingStory { .. } => "Ваш ответ:",
        ConversationState::Idle => "Ваш рассказ:",
    }
}

pub async fn run(
    mut manager: WorkflowManager,
    repo: &dyn Repository,
    user: UserContext,
    export_dir: &Path,
) -> Result<()> {
    let mut state = ConversationState::Idle;
    let mut options = vec![ActionOption {
        label: "❓ Задать мне вопрос".to_string(),
        action: UserAction::AskQuestion { pack: None },
    }];

    println!("Расскажите историю из своей жизни или попросите вопрос.");
    loop {
        let choice = match Select::new("Что дальше?", menu(&options)).prompt() {
            Ok(choice) => choice,
            Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => break,
            Err(e) => return Err(e.into()),
        };

        let inbound = match choice {
            Choice::Action(option) => Inbound::Action(option.action),
            Choice::Write => match Text::new(prompt_label(&state)).prompt() {
                Ok(text) => Inbound::Text(text),
                Err(InquireError::OperationCanceled) => continue,
                Err(e) => return Err(e.into()),
            },
            Choice::Voice => {
                let path = match Text::new("Путь к аудиофайлу:").prompt() {
                    Ok(path) => path,
                    Err(InquireError::OperationCanceled) => continue,
                    Err(e) => return Err(e.into()),
                };
                match tokio::fs::read(path.trim()).await {
                    Ok(audio) => Inbound::Voice(audio),
                    Err(e) => {
                        println!("Не удалось прочитать файл: {}", e);
                        continue;
                    }
                }
            }
            Choice::Progress => {
                let progress = book_progress(repo, user.user_id).await?;
                println!(
                    "\nВоспоминаний: {}. Глав: {} (заполнено {}). Примерно {:.0} стр.\n",
                    progress.memories, progress.chapters_total, progress.chapters_filled, progress.estimated_pages
                );
                continue;
            }
            Choice::Export => {
                let book = export_book(repo, user.user_id).await?;
                let path = export_dir.join(format!("book_{}.md", user.user_id));
                tokio::fs::write(&path, book)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("\nКнига сохранена: {}\n", path.display());
                continue;
            }
            Choice::Quit => break,
        };

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
        spinner.set_message("Обрабатываю…");
        spinner.enable_steady_tick(Duration::from_millis(120));

        let reply = manager.process(inbound, &user, state.clone()).await;
        spinner.finish_and_clear();

        println!("\n{}\n", reply.preview_text);
        state = reply.updated_state;
        options = reply.action_options;
        if options.is_empty() && state == ConversationState::Idle {
            options.push(ActionOption {
                label: "❓ Задать мне вопрос".to_string(),
                action: UserAction::AskQuestion { pack: None },
            });
        }
    }

    manager.shutdown().await;
    for failure in manager.job_failures() {
        log::warn!("Context job {} failed at {}: {}", failure.job, failure.at, failure.error);
    }
    Ok(())
}
