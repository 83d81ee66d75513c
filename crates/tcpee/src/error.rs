#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Settings(#[from] tcpee_settings::SettingsError),

    #[error("{0}")]
    Proxy(#[from] tcpee_proxy::ProxyError),
}
