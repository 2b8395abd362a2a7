use vertex_indexer::cli::run_cli;

fn main() {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
        .block_on(run_cli());

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
