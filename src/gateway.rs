//! Request handling
//!
//! Every inbound chat message ends up in [`Gateway::handle`]. Image commands
//! pass the pause switch and the access check before anything is submitted;
//! accepted jobs are registered with the tracker, which delivers and debits
//! them later. Prefixed administrative commands mutate the roll and the
//! ledger directly. Errors never escape: they are turned into a reply here.

use crate::access::{self, Verdict};
use crate::auth::AdminAuth;
use crate::buttons::is_visible;
use crate::client::{RenderClient, SubmitResponse, CODE_MODAL_REQUIRED, CODE_QUEUED, CODE_SUCCESS};
use crate::commands::{self, CommandKind, CommandSpec, ParsedCommand};
use crate::config::{Settings, PENDING_COMMAND_MAX_SIZE};
use crate::directory::{Contact, ContactDirectory};
use crate::error::GatewayError;
use crate::identity::Identity;
use crate::quota::{QuotaLedger, QuotaRecord, ResetTarget};
use crate::roll::{RollKind, RollSet, RollStore, RosterEntry};
use crate::tracker::TaskTracker;
use crate::utils::image_data_url;
use chrono::Utc;
use lazy_regex::lazy_regex;
use moka::future::Cache;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reply while the service is paused
pub const PAUSED_REPLY: &str = "⏸ The image service is paused, please contact an administrator.";
/// Reply to non-administrators running an administrator command
pub const NOT_ADMIN_REPLY: &str =
    "🚫 You are not allowed to do that, authenticate as an administrator first.";

static RE_USER_COMMAND: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?s)^/(imagine|img2img|up|describe|shorten|seed)(?:\s+(.*))?$");

/// Transport-neutral inbound message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sender and conversation
    pub identity: Identity,
    /// Text or photo caption
    pub text: Option<String>,
    /// Downloaded photo
    pub image: Option<Vec<u8>>,
}

/// What the transport should do with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not addressed to the gateway, or silently refused
    Ignored,
    /// Text reply to the originating conversation
    Reply(String),
    /// Access was denied; the transport decides whether to repeat the notice
    Denied(Verdict),
}

/// Image command waiting for its photo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    /// `/describe`
    Describe,
    /// `/img2img <prompt>`
    Img2Img {
        /// Text prompt sent along with the image
        prompt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UserCommand {
    Imagine(String),
    Img2Img(String),
    Up { task_id: String, button: String },
    Describe,
    Shorten(String),
    Seed(String),
}

impl UserCommand {
    fn pending(&self) -> Option<PendingCommand> {
        match self {
            Self::Describe => Some(PendingCommand::Describe),
            Self::Img2Img(prompt) => Some(PendingCommand::Img2Img {
                prompt: prompt.clone(),
            }),
            _ => None,
        }
    }
}

fn parse_user_command(text: &str) -> Option<Result<UserCommand, GatewayError>> {
    let caps = RE_USER_COMMAND.captures(text.trim())?;
    let rest = caps.get(2).map_or("", |m| m.as_str().trim());
    let required = |what: &str| {
        if rest.is_empty() {
            Err(GatewayError::Validation(format!("please add {what}")))
        } else {
            Ok(rest.to_string())
        }
    };
    let command = match caps.get(1).map(|m| m.as_str()) {
        Some("imagine") => required("a prompt").map(UserCommand::Imagine),
        Some("img2img") => required("a prompt").map(UserCommand::Img2Img),
        Some("shorten") => required("a prompt").map(UserCommand::Shorten),
        Some("seed") => required("a task ID").map(UserCommand::Seed),
        Some("describe") => Ok(UserCommand::Describe),
        Some("up") => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(task_id), Some(button)) => Ok(UserCommand::Up {
                    task_id: task_id.to_string(),
                    button: button.to_string(),
                }),
                _ => Err(GatewayError::Validation(
                    "usage: /up <task-id> <button number>".to_string(),
                )),
            }
        }
        _ => return None,
    };
    Some(command)
}

/// Users the service ignores entirely, administrators excepted
fn is_blocked(identity: &Identity, roll: &RollSet) -> bool {
    roll.is_user_blacklisted(identity)
        || identity.group.as_ref().is_some_and(|g| {
            roll.is_group_blacklisted(&g.name) && !roll.is_group_whitelisted(&g.name)
        })
}

fn require_private(identity: &Identity) -> Result<(), GatewayError> {
    if identity.is_group() {
        return Err(GatewayError::Validation(
            "to keep things private, use this command in a direct chat".to_string(),
        ));
    }
    Ok(())
}

fn usage(prefix: &str, spec: &CommandSpec) -> GatewayError {
    GatewayError::Validation(format!("usage: {prefix}{} {}", spec.name(), spec.args))
}

fn roll_listing(kind: RollKind, entries: &[RosterEntry]) -> String {
    if entries.is_empty() {
        return format!("📋 The {kind} is empty");
    }
    let mut out = format!("📋 {kind}:\n");
    for (index, entry) in entries.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", index + 1, entry.display());
    }
    out
}

enum Admission {
    Granted(QuotaRecord),
    Refused(Outcome),
}

/// Long-lived collaborators of the gateway
pub struct Services {
    /// Administrator and white/black lists
    pub roll: Arc<RollStore>,
    /// Per-identity quota
    pub ledger: Arc<QuotaLedger>,
    /// Outstanding jobs
    pub tracker: Arc<TaskTracker>,
    /// Rendering service
    pub client: Arc<dyn RenderClient>,
    /// Name validation for roll additions
    pub directory: Arc<dyn ContactDirectory>,
    /// Administrator password
    pub auth: Arc<AdminAuth>,
}

/// Request handler shared by every inbound message
pub struct Gateway {
    settings: Arc<Settings>,
    services: Services,
    paused: AtomicBool,
    pending: Cache<String, PendingCommand>,
}

impl Gateway {
    /// Creates a running (not paused) gateway
    #[must_use]
    pub fn new(settings: Arc<Settings>, services: Services) -> Self {
        let pending = Cache::builder()
            .max_capacity(PENDING_COMMAND_MAX_SIZE)
            .time_to_live(settings.pending_command_ttl())
            .build();
        Self {
            settings,
            services,
            paused: AtomicBool::new(false),
            pending,
        }
    }

    /// Whether image commands are currently refused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Image command stored for `user_id`, if any
    pub async fn pending_for(&self, user_id: &str) -> Option<PendingCommand> {
        self.pending.get(user_id).await
    }

    /// Whether a photo from `user_id` with this caption would be used, so the
    /// transport only downloads photos someone is waiting for
    pub async fn wants_image(&self, user_id: &str, caption: Option<&str>) -> bool {
        let inline = caption
            .and_then(parse_user_command)
            .and_then(Result::ok)
            .and_then(|c| c.pending());
        inline.is_some() || self.pending.contains_key(user_id)
    }

    /// Handles one inbound message
    pub async fn handle(&self, message: InboundMessage) -> Outcome {
        let user_id = message.identity.user_id.clone();
        match self.dispatch(message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    GatewayError::Storage(_) | GatewayError::ExpiredJob(_) => {
                        error!(user_id = %user_id, error = %e, "Request failed");
                    }
                    GatewayError::ExternalService(_) => {
                        warn!(user_id = %user_id, error = %e, "Rendering service call failed");
                    }
                    _ => debug!(user_id = %user_id, error = %e, "Request rejected"),
                }
                Outcome::Reply(e.user_message())
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) -> Result<Outcome, GatewayError> {
        let InboundMessage {
            identity,
            text,
            image,
        } = message;
        let text = text.as_deref().map(str::trim).unwrap_or_default();

        if let Some(image) = image {
            let inline = parse_user_command(text)
                .and_then(Result::ok)
                .and_then(|c| c.pending());
            return self.handle_photo(&identity, &image, inline).await;
        }
        if text.is_empty() {
            return Ok(Outcome::Ignored);
        }
        if let Some(parsed) = commands::parse(text, &self.settings.trigger_prefix) {
            return self.handle_command(&identity, parsed).await;
        }
        match parse_user_command(text) {
            Some(command) => self.handle_user_command(&identity, command?).await,
            None => Ok(Outcome::Ignored),
        }
    }

    /// Pause switch and access check shared by every image command
    async fn admit(&self, identity: &Identity) -> Result<Admission, GatewayError> {
        if self.is_paused() {
            return Ok(Admission::Refused(Outcome::Reply(PAUSED_REPLY.to_string())));
        }
        let record = self.services.ledger.get_or_init(identity).await?;
        let roll = self.services.roll.snapshot().await;
        let verdict = access::evaluate(identity, &roll, &record, Utc::now());
        if !verdict.is_allowed() {
            info!(
                user_id = %identity.user_id,
                reason = verdict.message_key(),
                "Access denied"
            );
            return Ok(Admission::Refused(Outcome::Denied(verdict)));
        }
        Ok(Admission::Granted(record))
    }

    async fn handle_user_command(
        &self,
        identity: &Identity,
        command: UserCommand,
    ) -> Result<Outcome, GatewayError> {
        let record = match self.admit(identity).await? {
            Admission::Granted(record) => record,
            Admission::Refused(outcome) => return Ok(outcome),
        };
        if let Some(pending) = command.pending() {
            let prompt = match pending {
                PendingCommand::Describe => "📷 Send me the image to describe",
                PendingCommand::Img2Img { .. } => "📷 Send me the reference image",
            };
            self.pending.insert(identity.user_id.clone(), pending).await;
            return Ok(Outcome::Reply(prompt.to_string()));
        }

        let state = identity.reply_target().to_state();
        let client = &self.services.client;
        match command {
            UserCommand::Imagine(prompt) => {
                info!(user_id = %identity.user_id, "Submitting imagine");
                let response = client.submit_imagine(&prompt, None, &state).await?;
                self.acknowledge(identity, &response, record.remaining, true)
                    .await
            }
            UserCommand::Shorten(prompt) => {
                let response = client.submit_shorten(&prompt, &state).await?;
                self.acknowledge(identity, &response, record.remaining, false)
                    .await
            }
            UserCommand::Up { task_id, button } => {
                let response = self.run_action(&task_id, &button, &state).await?;
                self.acknowledge(identity, &response, record.remaining, true)
                    .await
            }
            UserCommand::Seed(task_id) => {
                let response = client.image_seed(&task_id).await?;
                let text = match response.result_str() {
                    Some(seed) if response.code == CODE_SUCCESS => {
                        format!("✅ Seed retrieved\n📨 Task ID: {task_id}\n🔖 Seed: {seed}")
                    }
                    _ => format!(
                        "❌ Could not get the seed\n📨 Task ID: {task_id}\nℹ️ {}",
                        response.description
                    ),
                };
                Ok(Outcome::Reply(text))
            }
            UserCommand::Describe | UserCommand::Img2Img(_) => Ok(Outcome::Ignored),
        }
    }

    /// Resolves `/up` to a follow-up action and submits it
    async fn run_action(
        &self,
        task_id: &str,
        button: &str,
        state: &str,
    ) -> Result<SubmitResponse, GatewayError> {
        let index: usize = button.parse().map_err(|_| {
            GatewayError::Validation("the button number must be a positive integer".to_string())
        })?;
        let client = &self.services.client;
        let task = client
            .fetch_task(task_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id} does not exist")))?;
        // Numbering follows the rendered menu, which skips hidden buttons
        let mut visible = task.buttons.iter().filter(|b| is_visible(b));
        let chosen = index
            .checked_sub(1)
            .and_then(|i| visible.nth(i))
            .ok_or_else(|| {
                GatewayError::NotFound(format!("task {task_id} has no button {index}"))
            })?;
        if chosen.label == "Custom Zoom" {
            return Err(GatewayError::Validation(
                "Custom Zoom is not supported".to_string(),
            ));
        }
        let response = client
            .submit_action(&chosen.custom_id, task_id, state)
            .await?;
        if response.code != CODE_MODAL_REQUIRED {
            return Ok(response);
        }
        let modal_task = response.result_str().unwrap_or_else(|| task_id.to_string());
        debug!(task_id, modal_task = %modal_task, "Action needs a modal confirmation");
        Ok(client.submit_modal(&modal_task, state).await?)
    }

    async fn handle_photo(
        &self,
        identity: &Identity,
        image: &[u8],
        inline: Option<PendingCommand>,
    ) -> Result<Outcome, GatewayError> {
        let command = match inline {
            Some(command) => {
                self.pending.invalidate(&identity.user_id).await;
                command
            }
            None => match self.pending.remove(&identity.user_id).await {
                Some(command) => command,
                None => return Ok(Outcome::Ignored),
            },
        };
        let record = match self.admit(identity).await? {
            Admission::Granted(record) => record,
            Admission::Refused(outcome) => return Ok(outcome),
        };
        let data_url = image_data_url(image);
        let state = identity.reply_target().to_state();
        let client = &self.services.client;
        match command {
            PendingCommand::Describe => {
                let response = client.submit_describe(&data_url, &state).await?;
                self.acknowledge(identity, &response, record.remaining, false)
                    .await
            }
            PendingCommand::Img2Img { prompt } => {
                let response = client
                    .submit_imagine(&prompt, Some(data_url), &state)
                    .await?;
                self.acknowledge(identity, &response, record.remaining, true)
                    .await
            }
        }
    }

    /// Registers an accepted job and builds the submission reply
    async fn acknowledge(
        &self,
        identity: &Identity,
        response: &SubmitResponse,
        remaining: u32,
        consumes_quota: bool,
    ) -> Result<Outcome, GatewayError> {
        if !response.is_accepted() {
            return Ok(Outcome::Reply(format!(
                "❌ Task submission failed\nℹ️ {}\n⏳ Uses left today: {remaining}",
                response.description
            )));
        }
        let job_id = response.result_str().ok_or_else(|| {
            GatewayError::ExternalService(format!(
                "submission accepted with code {} but without a job id",
                response.code
            ))
        })?;
        self.services
            .tracker
            .register(&job_id, identity.key(), identity.reply_target())
            .await;
        info!(user_id = %identity.user_id, job_id = %job_id, "Job submitted");

        let mut text = String::from("✅ Your task has been submitted\n");
        if response.code == CODE_QUEUED {
            let _ = writeln!(text, "⏰ {}", response.description);
        } else {
            text.push_str("🚀 Processing, please wait\n");
        }
        let _ = write!(text, "📨 Task ID: {job_id}");
        if consumes_quota {
            let _ = write!(
                text,
                "\n⏳ Uses left today after this task: {}",
                remaining.saturating_sub(1)
            );
        }
        Ok(Outcome::Reply(text))
    }

    async fn handle_command(
        &self,
        identity: &Identity,
        parsed: Result<ParsedCommand, String>,
    ) -> Result<Outcome, GatewayError> {
        let roll = self.services.roll.snapshot().await;
        let is_admin = roll.is_admin(&identity.user_id);
        if !is_admin && is_blocked(identity, &roll) {
            debug!(user_id = %identity.user_id, "Command from blocked user ignored");
            return Ok(Outcome::Ignored);
        }
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(name) => {
                debug!(command = %name, "Unknown command");
                return Ok(Outcome::Ignored);
            }
        };
        let spec = parsed.spec;
        if spec.admin_only && !is_admin {
            return Ok(Outcome::Reply(NOT_ADMIN_REPLY.to_string()));
        }
        if spec.admin_only {
            info!(user_id = %identity.user_id, command = spec.name(), "Administrator command");
        }

        let prefix = self.settings.trigger_prefix.as_str();
        let text = match spec.kind {
            CommandKind::Help => {
                let record = self.services.ledger.get_or_init(identity).await?;
                commands::help_text(prefix, is_admin, Some(record.remaining))
            }
            CommandKind::AdminHelp if is_admin => commands::admin_help_text(prefix),
            CommandKind::AdminHelp => NOT_ADMIN_REPLY.to_string(),
            CommandKind::Auth => self.authenticate(identity, is_admin, &parsed).await?,
            CommandKind::Info => self.quota_overview().await,
            CommandKind::Stop => {
                self.paused.store(true, Ordering::Relaxed);
                info!(user_id = %identity.user_id, "Service paused");
                "⏸ Service paused".to_string()
            }
            CommandKind::Enable => {
                self.paused.store(false, Ordering::Relaxed);
                info!(user_id = %identity.user_id, "Service resumed");
                "▶️ Service enabled".to_string()
            }
            CommandKind::SetPassword => {
                require_private(identity)?;
                let password = parsed.arg(0).ok_or_else(|| usage(prefix, spec))?;
                self.services.auth.set_password(password).await?;
                "✅ Administrator password changed".to_string()
            }
            CommandKind::ListRoll(kind) => {
                require_private(identity)?;
                roll_listing(kind, roll.list(kind))
            }
            CommandKind::AddRoll(kind)
            | CommandKind::RemoveRoll(kind)
            | CommandKind::ClearRoll(kind) => {
                self.edit_roll(identity, kind, &parsed).await?
            }
            CommandKind::SetLimit
            | CommandKind::ResetLimit
            | CommandKind::Renew
            | CommandKind::DeleteQuota => self.edit_quota(&parsed).await?,
        };
        Ok(Outcome::Reply(text))
    }

    async fn authenticate(
        &self,
        identity: &Identity,
        is_admin: bool,
        parsed: &ParsedCommand,
    ) -> Result<String, GatewayError> {
        require_private(identity)?;
        if is_admin {
            return Ok("✅ You are already an administrator".to_string());
        }
        let password = parsed
            .arg(0)
            .ok_or_else(|| usage(&self.settings.trigger_prefix, parsed.spec))?;
        if !self.services.auth.verify(password).await {
            warn!(user_id = %identity.user_id, "Failed administrator authentication");
            return Ok("❌ Authentication failed".to_string());
        }
        let entry = RosterEntry::named(&identity.user_id, &identity.nickname);
        self.services.roll.add(RollKind::Admins, entry).await?;
        info!(user_id = %identity.user_id, "User authenticated as administrator");
        Ok("✅ Authentication successful, you are now an administrator".to_string())
    }

    async fn quota_overview(&self) -> String {
        let records = self.services.ledger.records().await;
        if records.is_empty() {
            return "📊 No quota records yet".to_string();
        }
        let mut out = String::from("📊 Remaining uses:\n");
        for (_, record) in records {
            let _ = writeln!(
                out,
                "{} ({}): {}",
                record.nickname, record.group_name, record.remaining
            );
        }
        out
    }

    async fn edit_roll(
        &self,
        identity: &Identity,
        kind: RollKind,
        parsed: &ParsedCommand,
    ) -> Result<String, GatewayError> {
        if kind == RollKind::Admins {
            require_private(identity)?;
        }
        let roll = &self.services.roll;
        if let CommandKind::ClearRoll(_) = parsed.spec.kind {
            let removed = roll.clear(kind).await?;
            return Ok(format!("✅ The {kind} has been cleared ({removed} removed)"));
        }

        // Group lists default to the group the command was sent from
        let token = match (parsed.arg(0), &identity.group) {
            (Some(arg), _) => arg.to_string(),
            (None, Some(group)) if kind.holds_groups() => group.name.clone(),
            (None, _) => return Err(usage(&self.settings.trigger_prefix, parsed.spec)),
        };
        if let CommandKind::RemoveRoll(_) = parsed.spec.kind {
            let removed = roll.remove(kind, &token).await?;
            return Ok(format!("✅ [{}] removed from the {kind}", removed.display()));
        }
        let entry = self.resolve_entry(kind, &token).await?;
        let added = roll.add(kind, entry).await?;
        Ok(format!("✅ [{}] added to the {kind}", added.display()))
    }

    /// Builds the entry to add, checking the name against the contact
    /// directory when configured to
    async fn resolve_entry(&self, kind: RollKind, token: &str) -> Result<RosterEntry, GatewayError> {
        let validate = self.settings.validate_roll_names;
        let directory = &self.services.directory;
        if kind.holds_groups() {
            if validate && !directory.group_exists(token).await {
                return Err(GatewayError::NotFound(format!("group [{token}] does not exist")));
            }
            return Ok(RosterEntry::token(token));
        }
        let contact = if validate {
            directory.resolve_user(token).await.ok_or_else(|| {
                GatewayError::NotFound(format!("user [{token}] is not in the contact list"))
            })?
        } else {
            Contact {
                id: token.to_string(),
                name: token.to_string(),
            }
        };
        Ok(match kind {
            RollKind::Admins => RosterEntry::named(contact.id, contact.name),
            _ => RosterEntry::token(token),
        })
    }

    async fn edit_quota(&self, parsed: &ParsedCommand) -> Result<String, GatewayError> {
        let ledger = &self.services.ledger;
        let missing = || usage(&self.settings.trigger_prefix, parsed.spec);
        match parsed.spec.kind {
            CommandKind::SetLimit => {
                let raw = parsed.arg(0).ok_or_else(missing)?;
                let value: i64 = raw.parse().map_err(|_| {
                    GatewayError::Validation(format!("[{raw}] is not a number"))
                })?;
                let limit = u32::try_from(value).map_err(|_| {
                    GatewayError::Validation("the limit must be between 0 and 4294967295".to_string())
                })?;
                let updated = ledger.set_default_limit(limit).await?;
                Ok(format!(
                    "✅ Daily limit set to {limit}, {updated} balances reset"
                ))
            }
            CommandKind::ResetLimit => {
                let target = ResetTarget::parse(parsed.arg(0));
                let updated = ledger.reset_limit(&target).await?;
                let limit = ledger.daily_limit().await;
                Ok(match target {
                    ResetTarget::All => {
                        format!("✅ All balances reset to {limit} ({updated} records)")
                    }
                    ResetTarget::Nickname(name) => {
                        format!("✅ Balance of [{name}] reset to {limit}")
                    }
                })
            }
            CommandKind::Renew => {
                let target = ResetTarget::parse(Some(parsed.arg(0).ok_or_else(missing)?));
                let days = match parsed.arg(1) {
                    Some(raw) => raw.parse::<i64>().ok().filter(|d| *d > 0).ok_or_else(|| {
                        GatewayError::Validation(format!("[{raw}] is not a positive number of days"))
                    })?,
                    None => self.settings.access_window_days,
                };
                let updated = ledger.renew(&target, days).await?;
                Ok(format!("✅ Access renewed for {days} days ({updated} records)"))
            }
            CommandKind::DeleteQuota => {
                let selector = parsed.arg(0).ok_or_else(missing)?;
                let removed = ledger.remove(selector).await?;
                Ok(format!("✅ Deleted {} quota records", removed.len()))
            }
            _ => Err(GatewayError::Validation(format!(
                "{} is not a quota command",
                parsed.spec.name()
            ))),
        }
    }
}
