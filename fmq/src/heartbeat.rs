/// Liveness hook called on every iteration of a spin-wait (blocking open,
/// blocking read, blocking write) so a supervisor can see the process is alive.
pub trait Heartbeat: Send {
    fn beat(&mut self, label: &str);
}

impl<F> Heartbeat for F
where
    F: FnMut(&str) + Send,
{
    fn beat(&mut self, label: &str) {
        self(label)
    }
}

pub(crate) fn noop() -> Box<dyn Heartbeat> {
    Box::new(|_: &str| {})
}
