//! A global store of flags that can impact research.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different sessions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct ResearchConfig {
    /// Size (in bytes) of pointers. Base terms of addresses must be of this size.
    pub pointer_size: usize,
    /// Run the structure researcher over the data-flow graph.
    pub enable_structure_research: bool,
    /// Research signatures of decompiled functions and apply them (re-decompiling callers).
    pub enable_signature_research: bool,
    /// Run the semantics researcher.
    pub enable_semantics_research: bool,
    /// Record the branch conditions of decompiled functions. Without this, the structure
    /// researcher never sees conditional constants.
    pub enable_const_conditions: bool,
    /// Log every data-flow pass (very noisy at trace level).
    pub log_data_flow_passes: bool,
    /// Upper bound on the number of times signature research re-decompiles callers for one
    /// session run.
    pub max_signature_rounds: usize,
}

impl ResearchConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        // Tests never initialize, and get the defaults.
        let init = unsafe { INTERNAL_CONFIG_INITIALIZER.take() };
        init.flatten().unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineResearchConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<ResearchConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: ResearchConfig = ResearchConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Research configuration parameters
pub enum CommandLineResearchConfig {
    DisableStructureResearch,
    DisableSignatureResearch,
    DisableSemanticsResearch,
    DisableConstConditions,
    EnableDataFlowPassLogging,
    ThirtyTwoBitPointers,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            pointer_size: 8,
            enable_structure_research: true,
            enable_signature_research: true,
            enable_semantics_research: true,
            enable_const_conditions: true,
            log_data_flow_passes: false,
            max_signature_rounds: 16,
        }
    }
}

impl From<Vec<CommandLineResearchConfig>> for ResearchConfig {
    fn from(v: Vec<CommandLineResearchConfig>) -> Self {
        use CommandLineResearchConfig::*;
        let mut r = ResearchConfig::default();
        for v in v {
            match v {
                DisableStructureResearch => {
                    r.enable_structure_research = false;
                }
                DisableSignatureResearch => {
                    r.enable_signature_research = false;
                }
                DisableSemanticsResearch => {
                    r.enable_semantics_research = false;
                }
                DisableConstConditions => {
                    r.enable_const_conditions = false;
                }
                EnableDataFlowPassLogging => {
                    r.log_data_flow_passes = true;
                }
                ThirtyTwoBitPointers => {
                    r.pointer_size = 4;
                }
            }
        }
        r
    }
}
