use console::style;

/// A progress line for the user, `cdflow2: <info>` in bold.
pub fn format_info(info: &str) -> String {
    style(format!("cdflow2: {info}")).bold().to_string()
}

/// A command about to be run, shown as `$ <command>`.
pub fn format_command(command: &str) -> String {
    format!("{} {}", style("$").bold(), style(command).cyan().bright())
}

/// Join command arguments for display.
pub fn display_command<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_is_prefixed() {
        let line = console::strip_ansi_codes(&format_info("getting release configuration..."))
            .into_owned();
        assert_eq!(line, "cdflow2: getting release configuration...");
    }

    #[test]
    fn command_has_prompt() {
        let line = console::strip_ansi_codes(&format_command("terraform plan")).into_owned();
        assert_eq!(line, "$ terraform plan");
    }

    #[test]
    fn display_joins_with_spaces() {
        assert_eq!(
            display_command(&["terraform", "workspace", "select", "live"]),
            "terraform workspace select live"
        );
    }
}
