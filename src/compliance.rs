//! Compliance filter chain: phone verification -> DNC -> TCPA, each stage
//! independently toggleable.
//!
//! Stages annotate; they never delete. The fully annotated contact set is
//! preserved on the result, and the "clean numbers only" view is a separate
//! projection (`callable_projection`) the caller can override. A disabled
//! stage leaves its flags `None` (unknown), never `Some(true)`.

use crate::config::StageToggles;
use crate::models::{LineType, LookupResult, PhoneContact};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;

/// One pipeline stage, polymorphic over the contact capability.
/// `annotate` must be pure over its input: running the chain twice with
/// identical inputs yields identical flags.
pub trait ComplianceStage {
    fn name(&self) -> &'static str;

    fn applies(&self, contact: &PhoneContact) -> bool {
        !contact.number.trim().is_empty()
    }

    fn annotate(&self, contact: PhoneContact) -> PhoneContact;
}

/// Validates the number (US region), normalizes to E.164, labels the line
/// type from the provider's reported value, and resolves the connected
/// flag. Unparseable numbers are flagged not-connected rather than dropped.
pub struct PhoneVerificationStage;

impl ComplianceStage for PhoneVerificationStage {
    fn name(&self) -> &'static str {
        "phone_verification"
    }

    fn annotate(&self, mut contact: PhoneContact) -> PhoneContact {
        match phonenumber::parse(Some(CountryId::US), &contact.number) {
            Ok(number) if phonenumber::is_valid(&number) => {
                contact.number = number.format().mode(Mode::E164).to_string();
                contact.is_connected = Some(contact.reported_connected.unwrap_or(true));
            }
            _ => {
                tracing::debug!("Unparseable phone number: {}", contact.number);
                contact.is_connected = Some(false);
            }
        }

        contact.line_type = match contact
            .reported_line_type
            .as_deref()
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("mobile") | Some("wireless") | Some("cell") => LineType::Mobile,
            Some("landline") | Some("fixed") => LineType::Landline,
            Some("voip") => LineType::Voip,
            _ => LineType::Unknown,
        };

        contact
    }
}

/// Copies the provider's Do-Not-Call indicator onto the normalized flag.
/// Absence of a report resolves to not-flagged, never to flagged.
pub struct DncStage;

impl ComplianceStage for DncStage {
    fn name(&self) -> &'static str {
        "dnc"
    }

    fn annotate(&self, mut contact: PhoneContact) -> PhoneContact {
        contact.dnc = Some(contact.reported_dnc.unwrap_or(false));
        contact
    }
}

/// Copies the provider's TCPA litigator indicator onto the normalized flag.
pub struct TcpaStage;

impl ComplianceStage for TcpaStage {
    fn name(&self) -> &'static str {
        "tcpa"
    }

    fn annotate(&self, mut contact: PhoneContact) -> PhoneContact {
        contact.litigator = Some(contact.reported_litigator.unwrap_or(false));
        contact
    }
}

/// Fixed-order chain over the enabled stages.
pub struct ComplianceChain {
    stages: Vec<Box<dyn ComplianceStage + Send + Sync>>,
}

impl ComplianceChain {
    pub fn from_toggles(toggles: &StageToggles) -> Self {
        let mut stages: Vec<Box<dyn ComplianceStage + Send + Sync>> = Vec::new();
        if toggles.phone_verification {
            stages.push(Box::new(PhoneVerificationStage));
        }
        if toggles.dnc {
            stages.push(Box::new(DncStage));
        }
        if toggles.tcpa {
            stages.push(Box::new(TcpaStage));
        }
        ComplianceChain { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Annotate every phone of every person in place. The contact set is
    /// never shrunk here.
    pub fn apply(&self, result: &mut LookupResult) {
        for person in &mut result.persons {
            let phones = std::mem::take(&mut person.phones);
            person.phones = phones
                .into_iter()
                .map(|mut contact| {
                    for stage in &self.stages {
                        if stage.applies(&contact) {
                            contact = stage.annotate(contact);
                        }
                    }
                    contact
                })
                .collect();
        }
    }
}

/// The "clean numbers" view: connected, mobile, not DNC-listed, and not a
/// known litigator unless the toggle keeps those in. Unknown flags count as
/// not-flagged; only an explicit negative excludes a number.
pub fn callable_projection(
    phones: &[PhoneContact],
    include_tcpa_blacklisted: bool,
) -> Vec<PhoneContact> {
    phones
        .iter()
        .filter(|p| {
            p.is_connected != Some(false)
                && p.line_type == LineType::Mobile
                && p.dnc != Some(true)
                && (include_tcpa_blacklisted || p.litigator != Some(true))
        })
        .cloned()
        .collect()
}
