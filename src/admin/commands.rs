use crate::world::position::Position;

/// Administrative chat commands. These only ever invoke the same public
/// registry/map/entity operations gameplay handlers use.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Kick { target: Option<String> },
    Online,
    Where,
    Teleport { position: Position },
    Heal { amount: f32 },
    Shutdown,
    Restart,
    Unknown(String),
}

pub fn parse_admin_command(message: &str) -> Result<Option<AdminCommand>, String> {
    let trimmed = message.trim();
    if !trimmed.starts_with('!') {
        return Ok(None);
    }

    let mut parts = trimmed[1..].split_whitespace();
    let command = parts
        .next()
        .ok_or_else(|| "admin command missing name".to_string())?;
    let command = command.to_ascii_lowercase();
    let parsed = match command.as_str() {
        "kick" => AdminCommand::Kick {
            target: parts.next().map(str::to_string),
        },
        "online" => AdminCommand::Online,
        "where" | "pos" => AdminCommand::Where,
        "teleport" | "tp" => {
            let x = parse_f32(parts.next())?;
            let y = parse_f32(parts.next())?;
            let z = parse_f32(parts.next())?;
            AdminCommand::Teleport {
                position: Position::new(x, y, z),
            }
        }
        "heal" => AdminCommand::Heal {
            amount: parse_f32(parts.next())?,
        },
        "shutdown" => AdminCommand::Shutdown,
        "restart" => AdminCommand::Restart,
        _ => AdminCommand::Unknown(command),
    };
    Ok(Some(parsed))
}

fn parse_f32(value: Option<&str>) -> Result<f32, String> {
    let value = value.ok_or_else(|| "admin command missing numeric value".to_string())?;
    value
        .parse::<f32>()
        .map_err(|_| format!("admin command expected number, got '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_command_text_is_ignored() {
        assert_eq!(parse_admin_command("hello there").unwrap(), None);
    }

    #[test]
    fn parses_online() {
        assert_eq!(
            parse_admin_command("!online").unwrap(),
            Some(AdminCommand::Online)
        );
    }

    #[test]
    fn parses_kick_with_target() {
        assert_eq!(
            parse_admin_command("!kick Tamsin").unwrap(),
            Some(AdminCommand::Kick {
                target: Some("Tamsin".to_string())
            })
        );
    }

    #[test]
    fn parses_teleport_coordinates() {
        assert_eq!(
            parse_admin_command("!tp 10.5 -3 0").unwrap(),
            Some(AdminCommand::Teleport {
                position: Position::new(10.5, -3.0, 0.0)
            })
        );
    }

    #[test]
    fn teleport_rejects_missing_coordinates() {
        assert!(parse_admin_command("!teleport 10").is_err());
    }

    #[test]
    fn parses_heal_amount() {
        assert_eq!(
            parse_admin_command("!heal 25").unwrap(),
            Some(AdminCommand::Heal { amount: 25.0 })
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            parse_admin_command("!whoami").unwrap(),
            Some(AdminCommand::Unknown("whoami".to_string()))
        );
    }
}
