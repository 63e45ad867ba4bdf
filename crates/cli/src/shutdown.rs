use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Watch for Ctrl-C: the first one asks for a graceful stop, a second
/// one demands an immediate exit.
pub fn spawn_ctrl_c_handler() -> mpsc::UnboundedReceiver<ShutdownSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut interrupts: u32 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            let signal = if interrupts == 1 {
                ShutdownSignal::Graceful
            } else {
                ShutdownSignal::Immediate
            };
            if tx.send(signal).is_err() || matches!(signal, ShutdownSignal::Immediate) {
                return;
            }
        }
    });
    rx
}
