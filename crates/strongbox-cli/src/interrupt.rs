use std::process;

use strongbox_core::CancelToken;
use tracing::warn;

const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Routes Ctrl-C to `token`: the first press cancels the running task so it
/// can roll back, a second press exits at once.
pub fn cancel_on_interrupt(token: &CancelToken) -> Result<(), ctrlc::Error> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if !on_interrupt(&token) {
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    })
}

/// Returns `false` when the token was already cancelled.
fn on_interrupt(token: &CancelToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    warn!("Interrupted, cancelling (press Ctrl-C again to quit)");
    token.cancel();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_first_interrupt_cancels_second_quits() {
        let token = CancelToken::new();
        assert!(on_interrupt(&token));
        assert!(token.is_cancelled());
        assert!(!on_interrupt(&token));
    }

    #[cfg(unix)]
    #[test]
    fn test_sigint_reaches_the_token() {
        let token = CancelToken::new();
        let engine_side = token.clone();
        cancel_on_interrupt(&token).unwrap();

        let status = process::Command::new("kill")
            .args(["-INT", &process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine_side.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(engine_side.is_cancelled());
    }
}
