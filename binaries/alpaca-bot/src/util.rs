use std::io::Write;

pub fn print_token(t: &str) {
    let mut stdout = std::io::stdout().lock();
    if let Err(err) = stdout.write_all(t.as_bytes()).and_then(|()| stdout.flush()) {
        log::warn!("Could not write to stdout: {err}");
    }
}
