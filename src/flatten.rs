//! Response flattening: a variable-depth result (N persons x M contacts)
//! becomes fixed-width slot arrays for the output row.
//!
//! Phones across all persons share one global ranked list capped at K; they
//! are not segmented per person. Each assigned slot copies its owning
//! person's first/last name (denormalization). Contacts beyond the cap are
//! dropped silently; that loss is a known property of the fixed-width
//! output shape, not an error.

use crate::models::{EmailSlot, LookupResult, PhoneSlot};
use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct FlattenedSlots {
    pub phones: Vec<PhoneSlot>,
    pub emails: Vec<EmailSlot>,
}

/// Flatten one result into at most `phone_cap` phone slots and `email_cap`
/// email slots, preserving provider order. No re-sorting by confidence;
/// ordering ambiguity is resolved by keeping the provider's ranking.
pub fn flatten(result: &LookupResult, phone_cap: usize, email_cap: usize) -> FlattenedSlots {
    let mut slots = FlattenedSlots::default();
    let mut dropped_phones = 0usize;
    let mut dropped_emails = 0usize;

    for person in &result.persons {
        for phone in &person.phones {
            if slots.phones.len() >= phone_cap {
                dropped_phones += 1;
                continue;
            }
            slots.phones.push(PhoneSlot {
                number: phone.number.clone(),
                line_type: phone.line_type,
                carrier: phone.carrier.clone(),
                confidence: phone.confidence,
                dnc: phone.dnc,
                litigator: phone.litigator,
                owner_first: person.first_name.clone(),
                owner_last: person.last_name.clone(),
            });
        }

        for email in &person.emails {
            if !is_plausible_email(&email.address) {
                tracing::debug!("Dropping implausible email: {}", email.address);
                continue;
            }
            if slots.emails.len() >= email_cap {
                dropped_emails += 1;
                continue;
            }
            slots.emails.push(EmailSlot {
                address: email.address.clone(),
                tested: email.tested,
                owner_first: person.first_name.clone(),
                owner_last: person.last_name.clone(),
            });
        }
    }

    if dropped_phones > 0 || dropped_emails > 0 {
        tracing::debug!(
            "Slot caps dropped {} phone(s) and {} email(s)",
            dropped_phones,
            dropped_emails
        );
    }

    slots
}

/// Pad populated slots out to the fixed capacity with empty entries.
pub fn into_fixed<T>(populated: Vec<T>, cap: usize) -> Vec<Option<T>> {
    let mut out: Vec<Option<T>> = populated.into_iter().map(Some).collect();
    out.truncate(cap);
    while out.len() < cap {
        out.push(None);
    }
    out
}

/// Reject obviously fake or malformed email addresses before they consume
/// a slot: placeholder digit runs, missing structure, junk domains.
pub fn is_plausible_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    // Placeholder patterns seen in provider data.
    let fake_patterns = ["999999", "111111", "000000", "123456789", "noemail"];
    for pattern in &fake_patterns {
        if email.to_lowercase().contains(pattern) {
            return false;
        }
    }

    // RFC 5322 simplified.
    let email_regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).unwrap();

    email_regex.is_match(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailContact, LineType, LookupResult, Person, PhoneContact};

    fn phone(number: &str) -> PhoneContact {
        PhoneContact {
            number: number.to_string(),
            line_type: LineType::Mobile,
            carrier: None,
            confidence: Some(0.9),
            is_connected: Some(true),
            dnc: Some(false),
            litigator: Some(false),
            reported_line_type: None,
            reported_dnc: None,
            reported_litigator: None,
            reported_connected: None,
        }
    }

    fn person(first: &str, last: &str, phones: Vec<PhoneContact>) -> Person {
        Person {
            first_name: first.to_string(),
            last_name: last.to_string(),
            is_property_owner: true,
            phones,
            emails: Vec::new(),
        }
    }

    fn matched(persons: Vec<Person>) -> LookupResult {
        LookupResult {
            matched: true,
            persons,
            diagnostic: None,
            raw: None,
        }
    }

    #[test]
    fn one_person_three_phones_denormalizes_name_three_times() {
        let result = matched(vec![person(
            "Ann",
            "Lee",
            vec![phone("+15165550100"), phone("+15165550101"), phone("+15165550102")],
        )]);

        let slots = flatten(&result, 10, 10);
        assert_eq!(slots.phones.len(), 3);
        for slot in &slots.phones {
            assert_eq!(slot.owner_first, "Ann");
            assert_eq!(slot.owner_last, "Lee");
        }

        let fixed = into_fixed(slots.phones, 10);
        assert_eq!(fixed.len(), 10);
        assert!(fixed[2].is_some());
        assert!(fixed[3].is_none());
        assert!(fixed[9].is_none());
    }

    #[test]
    fn slots_are_global_across_persons_and_switch_owner() {
        let result = matched(vec![
            person("Ann", "Lee", vec![phone("+15165550100"), phone("+15165550101")]),
            person("Bo", "Chen", vec![phone("+15165550200")]),
        ]);

        let slots = flatten(&result, 10, 10);
        assert_eq!(slots.phones.len(), 3);
        assert_eq!(slots.phones[1].owner_last, "Lee");
        assert_eq!(slots.phones[2].owner_last, "Chen");
    }

    #[test]
    fn overflow_beyond_cap_is_dropped_not_an_error() {
        let many: Vec<PhoneContact> = (0..15)
            .map(|i| phone(&format!("+1516555{:04}", i)))
            .collect();
        let result = matched(vec![person("Ann", "Lee", many)]);

        let slots = flatten(&result, 10, 10);
        assert_eq!(slots.phones.len(), 10);
        // Provider order preserved, first ten kept.
        assert_eq!(slots.phones[0].number, "+15165550000");
        assert_eq!(slots.phones[9].number, "+15165550009");
    }

    #[test]
    fn provider_order_is_not_resorted_by_confidence() {
        let mut low = phone("+15165550100");
        low.confidence = Some(0.1);
        let mut high = phone("+15165550101");
        high.confidence = Some(0.99);
        let result = matched(vec![person("Ann", "Lee", vec![low, high])]);

        let slots = flatten(&result, 10, 10);
        assert_eq!(slots.phones[0].number, "+15165550100");
    }

    #[test]
    fn implausible_emails_never_consume_slots() {
        let mut p = person("Ann", "Lee", vec![]);
        p.emails = vec![
            EmailContact {
                address: "1199999999@gmail.com".to_string(),
                tested: None,
            },
            EmailContact {
                address: "ann.lee@example.com".to_string(),
                tested: Some(true),
            },
        ];
        let result = matched(vec![p]);

        let slots = flatten(&result, 10, 10);
        assert_eq!(slots.emails.len(), 1);
        assert_eq!(slots.emails[0].address, "ann.lee@example.com");
    }

    #[test]
    fn email_plausibility() {
        assert!(is_plausible_email("user@example.com"));
        assert!(is_plausible_email("first.last+tag@sub.example.co"));
        assert!(!is_plausible_email("no-at-sign.example.com"));
        assert!(!is_plausible_email("user@nodot"));
        assert!(!is_plausible_email("000000@example.com"));
        assert!(!is_plausible_email("noemail@example.com"));
        assert!(!is_plausible_email(""));
    }

    #[test]
    fn empty_result_yields_empty_slots() {
        let slots = flatten(&LookupResult::no_match(), 10, 10);
        assert!(slots.phones.is_empty());
        assert!(slots.emails.is_empty());
    }
}
