//! Line-oriented console: parses typed commands and formats what the session
//! exposes. Nothing here talks to the ledger.

use ledger_abi::{
    Entity,
    TypeCharacter,
};

use crate::{
    dispatch::ActionOutcome,
    error::ClientError,
    session::SessionStatus,
    sync::SyncSnapshot,
    view::{
        entity_views,
        status_line,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Help,
    Status,
    SelectType(TypeCharacter),
    Create(Option<TypeCharacter>),
    Heal(u64),
    Fight { mine: u64, rival: u64 },
    Withdraw,
    ShowMine,
    ShowOthers,
    ShowAll,
    // devnet controls
    MineBlock,
    SwitchAccount(usize),
    SwitchNetwork(u64),
}

impl UserEvent {
    pub fn is_devnet_only(&self) -> bool {
        matches!(
            self,
            UserEvent::MineBlock | UserEvent::SwitchAccount(_) | UserEvent::SwitchNetwork(_)
        )
    }
}

pub const HELP: &str = "\
commands:
  type <0|1|2>           select BERSERKER, SPIRITUAL or ELEMENTARY for create
  create [0|1|2]         mint a character (selected type by default)
  heal <id>              heal one of your characters
  fight <mine> <rival>   fight a rival with one of your characters
  withdraw               withdraw the program balance (owner only)
  mine                   refresh and list your characters
  others                 list rival characters
  all                    read every character on the ledger
  status                 account, sync state and selected type
  help                   this text
  quit                   exit
devnet only:
  block                  produce a block
  account <index>        switch the wallet's current account
  network <id>           switch the wallet's network";

fn arg<T: std::str::FromStr>(parts: &[&str], index: usize, what: &str) -> Result<T, String> {
    let raw = parts
        .get(index)
        .ok_or_else(|| format!("missing {what}"))?;
    raw.parse()
        .map_err(|_| format!("{raw:?} is not a valid {what}"))
}

fn type_arg(raw: &str) -> Result<TypeCharacter, String> {
    raw.parse::<u64>()
        .ok()
        .and_then(TypeCharacter::try_from_code)
        .ok_or_else(|| format!("{raw:?} is not a character type; use 0, 1 or 2"))
}

/// `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<UserEvent>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = parts.first() else {
        return Ok(None);
    };
    let event = match command.to_ascii_lowercase().as_str() {
        "quit" | "exit" | "q" => UserEvent::Quit,
        "help" | "?" => UserEvent::Help,
        "status" => UserEvent::Status,
        "type" => {
            let raw = parts.get(1).ok_or("missing character type")?;
            UserEvent::SelectType(type_arg(raw)?)
        }
        "create" => UserEvent::Create(parts.get(1).map(|raw| type_arg(raw)).transpose()?),
        "heal" => UserEvent::Heal(arg(&parts, 1, "character id")?),
        "fight" => UserEvent::Fight {
            mine: arg(&parts, 1, "character id")?,
            rival: arg(&parts, 2, "rival id")?,
        },
        "withdraw" => UserEvent::Withdraw,
        "mine" => UserEvent::ShowMine,
        "others" => UserEvent::ShowOthers,
        "all" => UserEvent::ShowAll,
        "block" => UserEvent::MineBlock,
        "account" => UserEvent::SwitchAccount(arg(&parts, 1, "account index")?),
        "network" => UserEvent::SwitchNetwork(arg(&parts, 1, "network id")?),
        other => return Err(format!("unknown command {other:?}; type `help`")),
    };
    Ok(Some(event))
}

pub fn render_entities(title: &str, entities: &[Entity], action_in_flight: bool) -> String {
    if entities.is_empty() {
        return format!("{title}: none");
    }
    let mut out = format!("{title}:");
    for view in entity_views(entities, action_in_flight) {
        out.push_str("\n  ");
        out.push_str(&view.line());
    }
    out
}

pub fn render_status(
    status: &SessionStatus,
    snapshot: &SyncSnapshot,
    selected: TypeCharacter,
) -> String {
    match status {
        SessionStatus::Active { network_id, .. } => {
            format!("network {network_id} | {}", status_line(snapshot, selected))
        }
        SessionStatus::Halted { notice, .. } => render_notice(notice),
    }
}

/// Blocking notice for fatal session failures.
pub fn render_notice(err: &ClientError) -> String {
    let rule = "!".repeat(60);
    format!("{rule}\n  {err}\n  fix the wallet and switch account or network to retry\n{rule}")
}

pub fn render_outcome(outcome: &ActionOutcome) -> String {
    let block = outcome
        .receipt
        .block_number
        .map(|n| format!(" in block {n}"))
        .unwrap_or_default();
    let mut out = format!(
        "{} settled{block} (tx {})",
        outcome.action.kind(),
        outcome.receipt.tx_hash
    );
    if let Some(advisory) = &outcome.advisory {
        out.push_str("\n  note: ");
        out.push_str(advisory);
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn parse_command__fight__reads_both_ids() {
        assert_eq!(
            parse_command("fight 3 9"),
            Ok(Some(UserEvent::Fight { mine: 3, rival: 9 }))
        );
    }

    #[test]
    fn parse_command__create_without_type__uses_selection() {
        assert_eq!(parse_command("create"), Ok(Some(UserEvent::Create(None))));
        assert_eq!(
            parse_command("CREATE 1"),
            Ok(Some(UserEvent::Create(Some(TypeCharacter::Spiritual))))
        );
    }

    #[test]
    fn parse_command__type_out_of_range__is_an_error() {
        assert!(parse_command("type 3").is_err());
        assert!(parse_command("heal x").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn parse_command__blank_line__is_ignored() {
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn render_entities__empty__says_none() {
        assert_eq!(render_entities("mine", &[], false), "mine: none");
    }

    #[test]
    fn render_notice__unsupported_network__names_supported_ones() {
        let text = render_notice(&ClientError::UnsupportedNetwork { network_id: 3 });
        assert!(text.contains("Kovan (42)"));
    }
}
