//! Heuristic classification of method names into bypass categories.
//!
//! Matching is case-insensitive substring containment against a static
//! keyword table. A method may land in several categories, and a match is a
//! candidate only — nothing here inspects what the method actually does.

use crate::dex::patch::ForcedValue;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;

/// The protection families the patch engine knows how to neutralize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BypassCategory {
    Login,
    Iap,
    Root,
    Cert,
    Debug,
    Premium,
}

impl BypassCategory {
    pub const ALL: [BypassCategory; 6] = [
        BypassCategory::Login,
        BypassCategory::Iap,
        BypassCategory::Root,
        BypassCategory::Cert,
        BypassCategory::Debug,
        BypassCategory::Premium,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BypassCategory::Login => "login",
            BypassCategory::Iap => "iap",
            BypassCategory::Root => "root",
            BypassCategory::Cert => "cert",
            BypassCategory::Debug => "debug",
            BypassCategory::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<BypassCategory> {
        match s.to_ascii_lowercase().as_str() {
            "login" => Some(BypassCategory::Login),
            "iap" => Some(BypassCategory::Iap),
            "root" => Some(BypassCategory::Root),
            "cert" => Some(BypassCategory::Cert),
            "debug" => Some(BypassCategory::Debug),
            "premium" => Some(BypassCategory::Premium),
            _ => None,
        }
    }

    /// The outcome this category forces: success gates become true,
    /// detection checks become false.
    pub fn forced_value(&self) -> ForcedValue {
        match self {
            BypassCategory::Login | BypassCategory::Iap | BypassCategory::Debug | BypassCategory::Premium => {
                ForcedValue::True
            }
            BypassCategory::Root | BypassCategory::Cert => ForcedValue::False,
        }
    }
}

impl fmt::Display for BypassCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One immutable row of the rule table: a category, its lowercase keyword
/// set, and the value its rewrites force.
pub struct PatchRule {
    pub category: BypassCategory,
    pub keywords: &'static [&'static str],
    pub forced: ForcedValue,
}

pub static RULES: Lazy<Vec<PatchRule>> = Lazy::new(|| {
    BypassCategory::ALL
        .iter()
        .map(|&category| PatchRule {
            category,
            keywords: keywords_for(category),
            forced: category.forced_value(),
        })
        .collect()
});

fn keywords_for(category: BypassCategory) -> &'static [&'static str] {
    match category {
        BypassCategory::Login => &[
            "authenticate",
            "login",
            "verify",
            "validate",
            "isloggedin",
            "isauthenticated",
            "hasaccess",
            "checkauth",
        ],
        BypassCategory::Iap => &[
            "billingclient",
            "launchbillingflow",
            "acknowledgepurchase",
            "isfeaturesupported",
            "querypurchases",
            "verifypurchase",
            "ispurchased",
        ],
        BypassCategory::Root => &[
            "isrooted",
            "checkroot",
            "rootbeer",
            "roottools",
            "checkforroot",
            "detectroot",
            "suexists",
            "checksu",
            "subinary",
            "supath",
            "superuser",
            "test-keys",
        ],
        BypassCategory::Cert => &[
            "certificatepinner",
            "checkservertrusted",
            "x509trustmanager",
            "gettrustmanagers",
            "networksecurityconfig",
            "pinrecord",
            "sslpin",
        ],
        BypassCategory::Debug => &[
            "isdebuggerconnected",
            "waituntildebuggerattached",
            "isdebuggable",
            "detectdebug",
            "checkdebug",
            "antidebug",
        ],
        BypassCategory::Premium => &[
            "ispro",
            "ispremium",
            "haspremium",
            "hasfeature",
            "unlock",
            "isunlocked",
            "issubscribed",
            "subscription",
            "autorenewing",
        ],
    }
}

/// Categories whose keyword sets the method name matches, in table order.
pub fn classify(method_name: &str) -> Vec<BypassCategory> {
    let lower = method_name.to_ascii_lowercase();
    RULES
        .iter()
        .filter(|rule| rule.keywords.iter().any(|k| lower.contains(k)))
        .map(|rule| rule.category)
        .collect()
}
