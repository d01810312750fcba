use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmuError {
    /// The page is not backed and no missing-page handler is installed.
    #[error("Guest physical page not present: {0:#x}")]
    MissingPage(u64),

    /// The missing-page handler ran but the page was still absent on retry.
    #[error("Missing-page handler did not resolve {0:#x}")]
    UnresolvedFault(u64),

    /// The guest page tables do not map the address.
    #[error("Translation fault at {gva:#x} (level {level})")]
    TranslationFault { gva: u64, level: u8 },

    #[error("Non-canonical address: {0:#x}")]
    NonCanonical(u64),

    /// Raised by the execution core driving a [`crate::Cpu`].
    #[error("Execution core error: {0}")]
    Core(String),
}

impl EmuError {
    /// True for faults that belong to the guest (its page tables said no),
    /// as opposed to the host failing to back a physical page.
    pub fn is_translation_fault(&self) -> bool {
        matches!(
            self,
            EmuError::TranslationFault { .. } | EmuError::NonCanonical(_)
        )
    }

    pub fn is_missing_page(&self) -> bool {
        matches!(self, EmuError::MissingPage(_) | EmuError::UnresolvedFault(_))
    }
}

pub type Result<T> = std::result::Result<T, EmuError>;
