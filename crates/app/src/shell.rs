use std::collections::HashSet;
use std::sync::Arc;

use adhikari_backend::{Identity, LocalSessionProvider, MessageRole};
use adhikari_chat::{ChatMessage, ControllerCommand, ControllerEvent, MessageKey};
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{AppResult, ReadInputSnafu, SendCommandSnafu, WriteOutputSnafu};

pub const BRAND: &str = "Adhikari - your AI fashion stylist";

const SUGGESTIONS: [&str; 8] = [
    "Rave party",
    "Baby shower outfit",
    "Eminem Not Afraid outfit",
    "One Piece anime outfit",
    "I'm heading to Paris next week",
    "Planning a Miami beach in July",
    "Titanic movie outfits",
    "Tokyo in winter",
];

/// Landing prompts, shortest first.
pub fn landing_suggestions() -> Vec<&'static str> {
    let mut suggestions = SUGGESTIONS.to_vec();
    suggestions.sort_by_key(|suggestion| suggestion.len());
    suggestions
}

pub fn header(identity: &Identity) -> String {
    match identity.user() {
        Some(user) => format!("{BRAND} | signed in as {}", user.email),
        None => format!("{BRAND} | signed out"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellAction {
    Submit(String),
    SignIn(String),
    SignOut,
    DismissAuthPrompt,
    Quit,
    Help,
    Nothing,
}

/// Turns input lines into actions. Numbered picks work while the landing list is showing.
#[derive(Debug)]
pub struct LineInterpreter {
    suggestions: Vec<&'static str>,
    landing_visible: bool,
}

impl Default for LineInterpreter {
    fn default() -> Self {
        Self {
            suggestions: landing_suggestions(),
            landing_visible: true,
        }
    }
}

impl LineInterpreter {
    pub fn landing_visible(&self) -> bool {
        self.landing_visible
    }

    pub fn interpret(&mut self, line: &str, auth_prompt_open: bool) -> ShellAction {
        let line = line.trim();
        if line.is_empty() {
            return if auth_prompt_open {
                ShellAction::DismissAuthPrompt
            } else {
                ShellAction::Nothing
            };
        }

        let landing_visible = std::mem::replace(&mut self.landing_visible, false);

        if let Some(command) = line.strip_prefix('/') {
            let (name, argument) = command
                .split_once(char::is_whitespace)
                .map(|(name, argument)| (name, argument.trim()))
                .unwrap_or((command, ""));

            return match name {
                "signin" | "login" => ShellAction::SignIn(argument.to_string()),
                "signout" | "logout" => ShellAction::SignOut,
                "quit" | "exit" => ShellAction::Quit,
                _ => ShellAction::Help,
            };
        }

        if landing_visible
            && let Ok(pick) = line.parse::<usize>()
            && let Some(suggestion) = pick
                .checked_sub(1)
                .and_then(|index| self.suggestions.get(index))
        {
            return ShellAction::Submit((*suggestion).to_string());
        }

        ShellAction::Submit(line.to_string())
    }
}

/// Converts controller events into terminal lines, printing each message once.
#[derive(Debug, Default)]
pub struct Renderer {
    printed: HashSet<MessageKey>,
    auth_prompt_open: bool,
}

impl Renderer {
    pub fn auth_prompt_open(&self) -> bool {
        self.auth_prompt_open
    }

    pub fn render(&mut self, event: &ControllerEvent) -> Vec<String> {
        match event {
            ControllerEvent::MessagesChanged { messages, .. } => {
                // Rows that left the list may come back later, e.g. the greeting after sign-out.
                self.printed
                    .retain(|key| messages.iter().any(|message| message.key == *key));

                messages
                    .iter()
                    .filter(|message| self.printed.insert(message.key))
                    .map(message_line)
                    .collect()
            }
            ControllerEvent::IdentityChanged(identity) => vec![header(identity)],
            ControllerEvent::AuthRequired => {
                vec!["Please sign in to get outfit suggestions: /signin <email>".to_string()]
            }
            ControllerEvent::AuthPromptChanged(open) => {
                self.auth_prompt_open = *open;
                Vec::new()
            }
            ControllerEvent::BusyChanged(true) => vec!["styling...".to_string()],
            ControllerEvent::BusyChanged(false) => Vec::new(),
            ControllerEvent::SubmitFailed { reason } => {
                vec![format!("Could not send your message: {reason}")]
            }
        }
    }
}

fn message_line(message: &ChatMessage) -> String {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "stylist",
    };
    format!("{speaker}> {}", message.content)
}

fn help_lines() -> Vec<String> {
    vec![
        "/signin <email>  sign in".to_string(),
        "/signout         sign out".to_string(),
        "/quit            leave".to_string(),
    ]
}

fn landing_lines() -> Vec<String> {
    let mut lines = vec!["Try one of these:".to_string()];
    lines.extend(
        landing_suggestions()
            .into_iter()
            .enumerate()
            .map(|(index, suggestion)| format!("  {}. {suggestion}", index + 1)),
    );
    lines
}

/// Reads stdin and prints controller events until `/quit` or end of input.
pub async fn run_shell(
    sessions: Arc<LocalSessionProvider>,
    commands: mpsc::Sender<ControllerCommand>,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
) -> AppResult<()> {
    let mut stdout = tokio::io::stdout();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut interpreter = LineInterpreter::default();
    let mut renderer = Renderer::default();

    let mut intro = vec![header(&sessions.identity())];
    intro.extend(landing_lines());
    write_lines(&mut stdout, &intro).await?;

    loop {
        tokio::select! {
            line = input.next_line() => {
                let line = line.context(ReadInputSnafu { stage: "read-shell-line" })?;
                let Some(line) = line else {
                    break;
                };

                match interpreter.interpret(&line, renderer.auth_prompt_open()) {
                    ShellAction::Submit(text) => {
                        send(&commands, ControllerCommand::SetInput(text.clone())).await?;
                        send(&commands, ControllerCommand::Submit(text)).await?;
                    }
                    ShellAction::SignIn(email) => {
                        if let Err(error) = sessions.sign_in(&email) {
                            write_lines(&mut stdout, &[format!("Could not sign in: {error}")]).await?;
                        }
                    }
                    ShellAction::SignOut => {
                        if let Err(error) = sessions.sign_out() {
                            write_lines(&mut stdout, &[format!("Could not sign out: {error}")]).await?;
                        }
                    }
                    ShellAction::DismissAuthPrompt => {
                        send(&commands, ControllerCommand::DismissAuthPrompt).await?;
                    }
                    ShellAction::Help => write_lines(&mut stdout, &help_lines()).await?,
                    ShellAction::Quit => break,
                    ShellAction::Nothing => {}
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                write_lines(&mut stdout, &renderer.render(&event)).await?;
            }
        }
    }

    // The controller may already be gone; nothing is left to stop then.
    let _ = commands.send(ControllerCommand::Shutdown).await;
    Ok(())
}

async fn send(
    commands: &mpsc::Sender<ControllerCommand>,
    command: ControllerCommand,
) -> AppResult<()> {
    commands
        .send(command)
        .await
        .ok()
        .context(SendCommandSnafu {
            stage: "forward-shell-command",
        })
}

async fn write_lines(stdout: &mut tokio::io::Stdout, lines: &[String]) -> AppResult<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut text = lines.join("\n");
    text.push('\n');
    stdout
        .write_all(text.as_bytes())
        .await
        .context(WriteOutputSnafu {
            stage: "write-shell-output",
        })?;
    stdout.flush().await.context(WriteOutputSnafu {
        stage: "flush-shell-output",
    })
}
