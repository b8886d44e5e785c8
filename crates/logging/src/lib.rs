//! helpers for logging.

/// Log to stderr.
///
/// If called multiple times in the same process, only applies once.  Tests and demo binaries call this before doing
/// anything interesting so that `RUST_LOG` works as expected; without `RUST_LOG` set, info and above is shown.
pub fn log_to_stderr() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format(|buf, record| {
                use std::io::Write;

                let now = time::OffsetDateTime::now_utc();

                writeln!(
                    buf,
                    "{} {} time={} target={}",
                    record.level(),
                    record.args(),
                    now,
                    record.target()
                )
            })
            .init();
    });
}
