fn main() -> anyhow::Result<()> {
    kira_kc::cli::run::entry()
}
