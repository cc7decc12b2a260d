use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SQUID: Emoji<'_, '_> = Emoji("🦑 ", "");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏰ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_reply(msg: &str) {
    println!("{} {}", SQUID, msg);
}

pub fn print_job(id: &str, trigger: &str, next: &str, payload: &str) {
    println!(
        "  {} {} {} next {}\n     {}",
        CLOCK,
        style(id).dim(),
        style(trigger).bold().cyan(),
        style(next).yellow(),
        payload
    );
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "             _     _ _           _   ",
        " ___ __ _ _ _(_)__| | |__  ___ _| |_ ",
        "(_-</ _` | || | / _` | '_ \\/ _ \\_   _|",
        "/__/\\__, |\\_,_|_\\__,_|_.__/\\___/ |_| ",
        "       |_|                           ",
    ];

    // Gradient: #f472b6 → #22d3ee, left to right
    let from = (244u8, 114u8, 182u8);
    let to = (34u8, 211u8, 238u8);
    let max_w = lines.iter().map(|l| l.len()).max().unwrap_or(1) as u32;

    println!();
    for line in lines {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let (r, g, b) = lerp_color(from, to, (x as u32 * 1000 / max_w).min(1000));
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");
    println!("\x1b[38;2;34;211;238mOne brain, many tentacles.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let mix = |x: u8, y: u8| ((x as u32 * (1000 - t) + y as u32 * t) / 1000) as u8;
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}

pub fn print_goodbye() {
    println!("\n{} {}", SQUID, style("squidbot signing off. Bye!").bold().cyan());
}
