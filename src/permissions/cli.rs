use super::prompt::{PromptOutcome, PromptRequest, PromptSurface};
use super::GrantKind;
use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Terminal prompt: a boxed summary on stderr, one line read from stdin.
/// A timeout or unreadable input counts as dismissal.
pub struct CliPromptSurface {
    timeout: Duration,
}

impl CliPromptSurface {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn default_timeout() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl PromptSurface for CliPromptSurface {
    fn prompt_user<'a>(
        &'a self,
        request: &'a PromptRequest,
    ) -> Pin<Box<dyn Future<Output = Result<PromptOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let scopes = request
                .scopes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");

            eprintln!();
            eprintln!("┌─ Permission Request ─────────────────────────────");
            eprintln!("│ Origin:  {}", request.origin);
            eprintln!("│ Scopes:  {scopes}");
            if !request.tools.is_empty() {
                eprintln!("│ Tools:   {}", request.tools.join(", "));
            }
            if let Some(reason) = &request.reason {
                eprintln!("│ Reason:  {reason}");
            }
            eprintln!("├──────────────────────────────────────────────────");
            eprintln!("│ Allow [O]nce  Allow [A]lways  [D]eny");
            eprintln!("└──────────────────────────────────────────────────");
            eprint!("  > ");

            let answer = tokio::time::timeout(self.timeout, read_answer()).await;

            Ok(match answer {
                Ok(Ok(answer)) => parse_answer(&answer, &request.tools),
                Ok(Err(error)) => {
                    tracing::warn!(%error, "failed to read permission answer");
                    PromptOutcome::Dismissed
                }
                Err(_) => PromptOutcome::Dismissed,
            })
        })
    }
}

fn parse_answer(answer: &str, tools: &[String]) -> PromptOutcome {
    match answer.trim().chars().next().map(|ch| ch.to_ascii_lowercase()) {
        Some('o') => PromptOutcome::Granted {
            kind: GrantKind::Once,
            allowed_tools: tools.to_vec(),
        },
        Some('a') => PromptOutcome::Granted {
            kind: GrantKind::Always,
            allowed_tools: tools.to_vec(),
        },
        Some('d') => PromptOutcome::Denied,
        _ => PromptOutcome::Dismissed,
    }
}

async fn read_answer() -> Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        Ok::<_, std::io::Error>(input)
    })
    .await??;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_map_to_outcomes() {
        let tools = vec!["search".to_string()];
        assert_eq!(
            parse_answer("o\n", &tools),
            PromptOutcome::Granted {
                kind: GrantKind::Once,
                allowed_tools: tools.clone(),
            }
        );
        assert_eq!(
            parse_answer("Always", &tools),
            PromptOutcome::Granted {
                kind: GrantKind::Always,
                allowed_tools: tools.clone(),
            }
        );
        assert_eq!(parse_answer("d", &tools), PromptOutcome::Denied);
        assert_eq!(parse_answer("", &tools), PromptOutcome::Dismissed);
        assert_eq!(parse_answer("x", &tools), PromptOutcome::Dismissed);
    }
}
