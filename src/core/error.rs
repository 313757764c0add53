#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    #[error("Free limit of {0} memories reached")]
    LimitReached(u32),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub const GENERIC_FAILURE: &str = "Что-то пошло не так при обработке. Попробуйте ещё раз. 🙏";

impl PipelineError {
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Validation(message) => message.clone(),
            PipelineError::NotFound(what) => format!("Не нашёл {}. Возможно, запись уже удалена.", what),
            PipelineError::LimitReached(limit) => format!(
                "Вы записали {} воспоминаний — это предел бесплатной версии. \
                 Оформите подписку, чтобы продолжить книгу.",
                limit
            ),
            PipelineError::Unexpected(_) => GENERIC_FAILURE.to_string(),
        }
    }

    pub fn resets_state(&self) -> bool {
        matches!(self, PipelineError::Unexpected(_) | PipelineError::NotFound(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
