use std::process;

mod headless;
mod logging;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let level = match logging::level_from_args(&args) {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };
    logging::setup_tracing(level);

    tracing::info!("solidtree starting");

    if let Err(err) = headless::run(&args) {
        tracing::error!("headless: {err}");
        eprintln!("headless error: {err}");
        process::exit(1);
    }
}
