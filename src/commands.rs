//! Command table, parser and help text
//!
//! Administrative and meta commands are plain text starting with the trigger
//! prefix (`$` by default). Each command has a canonical id plus aliases;
//! the table is static data so the help text and the parser never disagree.

use crate::roll::RollKind;
use std::fmt::Write as _;

/// What a command does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Usage help and remaining uses
    Help,
    /// Administrator command list
    AdminHelp,
    /// Become an administrator with the password
    Auth,
    /// Nickname and remaining uses of every ledger record
    Info,
    /// Pause the service
    Stop,
    /// Resume the service
    Enable,
    /// Change the administrator password
    SetPassword,
    /// Show a roll list
    ListRoll(RollKind),
    /// Add to a roll list
    AddRoll(RollKind),
    /// Remove from a roll list
    RemoveRoll(RollKind),
    /// Empty a roll list
    ClearRoll(RollKind),
    /// Change the daily limit and rewrite every balance
    SetLimit,
    /// Restore balances for everyone or one nickname
    ResetLimit,
    /// Extend the access window
    Renew,
    /// Delete quota records
    DeleteQuota,
}

/// One row of the command table
#[derive(Debug)]
pub struct CommandSpec {
    /// Behaviour
    pub kind: CommandKind,
    /// Accepted names, canonical id first
    pub aliases: &'static [&'static str],
    /// Argument synopsis for help output
    pub args: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Restricted to administrators
    pub admin_only: bool,
}

impl CommandSpec {
    /// Canonical name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.aliases.first().copied().unwrap_or_default()
    }
}

macro_rules! command {
    ($kind:expr, [$($alias:literal),+ $(,)?], $args:literal, $desc:literal, $admin:literal) => {
        CommandSpec {
            kind: $kind,
            aliases: &[$($alias),+],
            args: $args,
            description: $desc,
            admin_only: $admin,
        }
    };
}

/// Every command the gateway understands
pub static COMMANDS: &[CommandSpec] = &[
    command!(CommandKind::Help, ["mj_help", "help", "mjhelp"], "", "Show help and remaining uses", false),
    command!(CommandKind::AdminHelp, ["mj_admin_cmd", "admin_cmd"], "", "List administrator commands", false),
    command!(CommandKind::Auth, ["mj_admin_password", "auth"], "<password>", "Authenticate as administrator (private chat)", false),
    command!(CommandKind::Info, ["mj_g_info", "info"], "", "Show nickname and remaining uses of every record", true),
    command!(CommandKind::Stop, ["mj_stop", "stop_mj", "stop"], "", "Pause the service", true),
    command!(CommandKind::Enable, ["mj_enable", "enable_mj", "enable"], "", "Resume the service", true),
    command!(CommandKind::SetPassword, ["set_mj_admin_password", "set_password"], "<password>", "Change the administrator password (private chat)", true),
    command!(CommandKind::ListRoll(RollKind::Admins), ["mj_g_admin_list", "admins"], "", "List administrators (private chat)", true),
    command!(CommandKind::AddRoll(RollKind::Admins), ["mj_s_admin_list", "add_admin"], "<user id or name>", "Add an administrator (private chat)", true),
    command!(CommandKind::RemoveRoll(RollKind::Admins), ["mj_r_admin_list", "remove_admin"], "<user id, name or index>", "Remove an administrator (private chat)", true),
    command!(CommandKind::ClearRoll(RollKind::Admins), ["mj_c_admin_list", "clear_admins"], "", "Remove every administrator (private chat)", true),
    command!(CommandKind::SetLimit, ["mj_s_limit", "set_limit"], "<n>", "Set the daily limit and reset every balance to it", true),
    command!(CommandKind::ResetLimit, ["mj_r_limit", "reset_limit"], "[all|<nickname>]", "Restore daily balances", true),
    command!(CommandKind::Renew, ["mj_renew", "renew"], "<all|nickname> [days]", "Extend the access window", true),
    command!(CommandKind::DeleteQuota, ["mj_d_info", "delete_quota"], "<identity key|nickname>", "Delete quota records", true),
    command!(CommandKind::ListRoll(RollKind::GroupWhitelist), ["mj_g_wgroup", "wgroups"], "", "List whitelisted groups (private chat)", true),
    command!(CommandKind::AddRoll(RollKind::GroupWhitelist), ["mj_s_wgroup", "add_wgroup"], "[group]", "Whitelist a group", true),
    command!(CommandKind::RemoveRoll(RollKind::GroupWhitelist), ["mj_r_wgroup", "remove_wgroup"], "[group or index]", "Remove a whitelisted group", true),
    command!(CommandKind::ClearRoll(RollKind::GroupWhitelist), ["mj_c_wgroup", "clear_wgroups"], "", "Empty the group whitelist", true),
    command!(CommandKind::ListRoll(RollKind::UserWhitelist), ["mj_g_wuser", "wusers"], "", "List whitelisted users (private chat)", true),
    command!(CommandKind::AddRoll(RollKind::UserWhitelist), ["mj_s_wuser", "add_wuser"], "<user id or name>", "Whitelist a user", true),
    command!(CommandKind::RemoveRoll(RollKind::UserWhitelist), ["mj_r_wuser", "remove_wuser"], "<user id, name or index>", "Remove a whitelisted user", true),
    command!(CommandKind::ClearRoll(RollKind::UserWhitelist), ["mj_c_wuser", "clear_wusers"], "", "Empty the user whitelist", true),
    command!(CommandKind::ListRoll(RollKind::GroupBlacklist), ["mj_g_bgroup", "bgroups"], "", "List blacklisted groups (private chat)", true),
    command!(CommandKind::AddRoll(RollKind::GroupBlacklist), ["mj_s_bgroup", "add_bgroup"], "[group]", "Blacklist a group", true),
    command!(CommandKind::RemoveRoll(RollKind::GroupBlacklist), ["mj_r_bgroup", "remove_bgroup"], "[group or index]", "Remove a blacklisted group", true),
    command!(CommandKind::ClearRoll(RollKind::GroupBlacklist), ["mj_c_bgroup", "clear_bgroups"], "", "Empty the group blacklist", true),
    command!(CommandKind::ListRoll(RollKind::UserBlacklist), ["mj_g_buser", "busers"], "", "List blacklisted users (private chat)", true),
    command!(CommandKind::AddRoll(RollKind::UserBlacklist), ["mj_s_buser", "add_buser"], "<user id or name>", "Blacklist a user", true),
    command!(CommandKind::RemoveRoll(RollKind::UserBlacklist), ["mj_r_buser", "remove_buser"], "<user id, name or index>", "Remove a blacklisted user", true),
    command!(CommandKind::ClearRoll(RollKind::UserBlacklist), ["mj_c_buser", "clear_busers"], "", "Empty the user blacklist", true),
];

/// Parsed administrative or meta command
#[derive(Debug)]
pub struct ParsedCommand {
    /// Matched table row
    pub spec: &'static CommandSpec,
    /// Whitespace-separated arguments
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// Argument at `index`, if any
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Looks a command up by any of its aliases
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.aliases.contains(&name))
}

/// Parses `text` when it starts with `prefix`.
///
/// Returns `None` for text without the prefix; `Some(Err(name))` when the
/// prefix is present but the command is unknown.
#[must_use]
pub fn parse(text: &str, prefix: &str) -> Option<Result<ParsedCommand, String>> {
    let rest = text.trim().strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args = words.map(str::to_string).collect();
    Some(find(name).map(|spec| ParsedCommand { spec, args }).ok_or_else(|| name.to_string()))
}

fn push_entry(out: &mut String, prefix: &str, spec: &CommandSpec) {
    let _ = write!(out, "{prefix}{}", spec.name());
    if !spec.args.is_empty() {
        let _ = write!(out, " {}", spec.args);
    }
    let _ = writeln!(out, " - {}", spec.description);
}

/// User-facing help
#[must_use]
pub fn help_text(prefix: &str, is_admin: bool, remaining: Option<u32>) -> String {
    let mut out = String::from("🎨 Image generation\n");
    out.push_str("/imagine <prompt> - generate an image\n");
    out.push_str("/img2img <prompt> - generate from a reference image (send the photo next)\n");
    out.push_str("/up <task-id> <n> - run action n of a finished task\n");
    out.push_str("/describe - describe an image (send the photo next)\n");
    out.push_str("/shorten <prompt> - analyse and shorten a prompt\n");
    out.push_str("/seed <task-id> - show the seed of a finished task\n\n");
    for spec in COMMANDS.iter().filter(|c| !c.admin_only) {
        push_entry(&mut out, prefix, spec);
    }
    if is_admin {
        let _ = writeln!(out, "\n👑 You are an administrator: {prefix}admin_cmd lists your commands");
    } else if let Some(remaining) = remaining {
        let _ = writeln!(out, "\n⏳ Uses left today: {remaining}");
    }
    out
}

/// Administrator command list
#[must_use]
pub fn admin_help_text(prefix: &str) -> String {
    let mut out = String::from("👑 Administrator commands\n");
    for spec in COMMANDS.iter().filter(|c| c.admin_only) {
        push_entry(&mut out, prefix, spec);
    }
    out
}
