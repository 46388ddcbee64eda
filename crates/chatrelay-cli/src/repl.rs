//! Line-based chat session
//!
//! Streams the assistant reply as it grows and prompts for interrupts.

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

use chatrelay_core::{
    ConversationEvent, InterruptKind, InterruptRequest, InterruptResolution, Message, Role,
    SendOptions,
};

use crate::Services;

pub struct Session {
    services: Services,
    conversation_id: String,
    options: SendOptions,
    input: Lines<BufReader<Stdin>>,
}

impl Session {
    pub fn new(services: Services, conversation_id: String, options: SendOptions) -> Self {
        Self {
            services,
            conversation_id,
            options,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Read messages until EOF or `/quit`
    pub async fn run(&mut self) -> Result<()> {
        println!("Conversation {} (/quit to leave)", self.conversation_id);
        if let Some(conversation) = self.services.store.conversation(&self.conversation_id) {
            for message in &conversation.messages {
                print_message(message);
            }
        }

        loop {
            print!("> ");
            std::io::stdout().flush().ok();
            let Some(line) = self.input.next_line().await? else {
                break;
            };
            let text = line.trim();
            match text {
                "" => continue,
                "/quit" | "/exit" => break,
                _ => self.exchange(text).await?,
            }
        }
        Ok(())
    }

    /// Send one message, printing the reply and answering interrupts
    pub async fn exchange(&mut self, text: &str) -> Result<()> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let subscription = self
            .services
            .store
            .subscribe(Some(&self.conversation_id), move |_, event| {
                let _ = tx.send(event.clone());
            });

        let relay = self.services.relay.clone();
        let conversation_id = self.conversation_id.clone();
        let text = text.to_string();
        let options = self.options.clone();
        let mut send =
            tokio::spawn(async move { relay.send(&conversation_id, &text, options).await });

        let mut printer = ReplyPrinter::default();
        let joined = loop {
            tokio::select! {
                joined = &mut send => break joined,
                Some(event) = events.recv() => match event {
                    ConversationEvent::MessageUpdated(message) if message.role == Role::Assistant => {
                        printer.show(&message);
                    }
                    ConversationEvent::InterruptRaised(request) => {
                        printer.break_line();
                        self.answer(request).await?;
                    }
                    _ => {}
                },
            }
        };
        self.services.store.unsubscribe(subscription);

        match joined? {
            Ok(message) => {
                printer.show(&message);
                printer.break_line();
                if message.is_error {
                    if let Some(reason) = self
                        .services
                        .store
                        .conversation(&self.conversation_id)
                        .and_then(|c| c.last_error)
                    {
                        eprintln!("({reason})");
                    }
                }
            }
            Err(e) => {
                printer.break_line();
                eprintln!("Error: {e}");
            }
        }
        Ok(())
    }

    async fn answer(&mut self, request: InterruptRequest) -> Result<()> {
        match request.kind {
            InterruptKind::Confirmation => self.confirm(request).await,
            InterruptKind::Auth => self.authenticate(request).await,
        }
    }

    async fn confirm(&mut self, request: InterruptRequest) -> Result<()> {
        println!(
            "The assistant wants to run: {}",
            request.action.as_deref().unwrap_or("an action")
        );
        if let Some(details) = &request.details {
            println!("{}", serde_json::to_string_pretty(details)?);
        }
        print!("Allow? [y/N] ");
        std::io::stdout().flush().ok();

        let line = self.input.next_line().await?.unwrap_or_default();
        let resolution = if matches!(line.trim(), "y" | "Y" | "yes") {
            InterruptResolution::Confirmed
        } else {
            InterruptResolution::Cancelled
        };
        self.resolve(&request, resolution);
        Ok(())
    }

    async fn authenticate(&mut self, request: InterruptRequest) -> Result<()> {
        let service = request.service.clone().unwrap_or_default();
        match self.services.broker.init_auth(&service).await {
            Ok(init) => {
                println!("Connect {service} to continue: {}", init.redirect_url);
                println!("Waiting for authorization (type c to cancel)...");
            }
            Err(e) => {
                eprintln!("Could not start {service} authorization: {e}");
                self.resolve(&request, InterruptResolution::Cancelled);
                return Ok(());
            }
        }

        let mut poll = self
            .services
            .poller
            .spawn(&self.conversation_id, self.options.auth_status.clone());
        loop {
            tokio::select! {
                _ = &mut poll => {
                    if let Some(conversation) = self.services.store.conversation(&self.conversation_id) {
                        tracing::info!(status = ?conversation.status, "Auth polling finished");
                    }
                    return Ok(());
                }
                line = self.input.next_line() => {
                    match line? {
                        Some(line) if line.trim().eq_ignore_ascii_case("c") => {
                            poll.abort();
                            self.resolve(&request, InterruptResolution::Cancelled);
                            return Ok(());
                        }
                        Some(_) => println!("Still waiting for {service} (type c to cancel)"),
                        None => {
                            poll.abort();
                            self.resolve(&request, InterruptResolution::Cancelled);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn resolve(&self, request: &InterruptRequest, resolution: InterruptResolution) {
        let delivered = self.services.store.resolve_interrupt(
            &self.conversation_id,
            &request.resume_token,
            resolution,
        );
        if !delivered {
            println!("That request has already expired.");
        }
    }
}

/// Prints the growing assistant reply without repeating what is on screen
///
/// One exchange has one reply; its id may change once the backend assigns it.
#[derive(Default)]
struct ReplyPrinter {
    shown: String,
}

impl ReplyPrinter {
    fn show(&mut self, message: &Message) {
        match message.content.strip_prefix(self.shown.as_str()) {
            Some(rest) => print!("{rest}"),
            // Content was replaced rather than extended
            None => print!("\n{}", message.content),
        }
        std::io::stdout().flush().ok();
        self.shown = message.content.clone();
    }

    fn break_line(&mut self) {
        if !self.shown.is_empty() {
            println!();
        }
        self.shown.clear();
    }
}

pub fn print_message(message: &Message) {
    let marker = match (message.is_error, message.is_partial) {
        (true, true) => " [interrupted]",
        (true, false) => " [failed]",
        _ => "",
    };
    println!("{}{}: {}", message.role.as_str(), marker, message.content);
}
