/// The user agent's route back to the login entry point.
///
/// Called whenever the session becomes unrecoverable. A GUI would switch
/// screens here; the CLI prints a hint.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

impl<F> Navigator for F
where
    F: Fn() + Send + Sync,
{
    fn redirect_to_login(&self) {
        self()
    }
}
