use anyhow::Result;

fn main() -> Result<()> {
    butlr_rs::cli::run()
}
