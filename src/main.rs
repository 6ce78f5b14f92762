fn main() {
    #[cfg(feature = "cli")]
    schemadelta::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("schemadelta: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
