fn main() {
    // Precondition/config failures exit 1 with a severity-tagged message and
    // without leaving a partial deployment behind.
    if let Err(e) = appmaster::am::main() {
        eprintln!("SEVERE: {e:#}");
        std::process::exit(1);
    }
}
