/// Overrides supplied by the embedding process, applied on top of file and environment sources.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded last among the files
    pub cfg_name: Option<String>,
    pub delivery_workers: Option<usize>,
    pub dead_letter_enabled: Option<bool>,
}
