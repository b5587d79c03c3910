use console::Style;

const BANNER: &str = r#"
       ╦╦ ╦╔╗╔╔═╗╔╦╗╦╔═╗╔╗╔
       ║║ ║║║║║   ║ ║║ ║║║║
      ╚╝╚═╝╝╚╝╚═╝ ╩ ╩╚═╝╝╚╝"#;

/// Print the startup banner with version info.
pub fn print_banner() {
    let green = Style::new().green().bold();
    let dim = Style::new().dim();

    println!("{}", green.apply_to(BANNER));
    println!(
        "  {}",
        dim.apply_to(format!(
            "v{}  peer-to-peer chat and file exchange",
            env!("CARGO_PKG_VERSION")
        ))
    );
    println!();
}
