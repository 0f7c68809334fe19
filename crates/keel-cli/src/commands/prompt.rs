use async_trait::async_trait;
use console::style;

use keel_core::{KeelError, Result};
use keel_ext::services::PromptService;

/// Extension output and confirmations on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl PromptService for TerminalPrompt {
    fn output(&self, extension: &str, text: &str) {
        println!("{} {text}", style(format!("[{extension}]")).cyan());
    }

    async fn confirm(&self, extension: &str, question: &str) -> Result<bool> {
        let prompt = format!("[{extension}] {question}");
        tokio::task::spawn_blocking(move || {
            use dialoguer::{Confirm, theme::ColorfulTheme};
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| KeelError::Service {
            service: "prompt".into(),
            reason: e.to_string(),
        })?
        .map_err(|e| KeelError::Service {
            service: "prompt".into(),
            reason: e.to_string(),
        })
    }
}
