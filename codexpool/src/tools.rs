//! Observer operations consumed by the CLI collaborator.
//!
//! All transforms are pure: they take a domain snapshot and return the next
//! one. Rows are addressed by 1-based display index, never by identity key,
//! so commands stay unambiguous even when identity keys collide.

use crate::account::OAuthDomain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    /// 1-based; the authoritative row identifier for subsequent commands.
    pub display_index: usize,
    pub identity_key: String,
    pub email: Option<String>,
    pub plan: Option<String>,
    pub label: String,
    pub enabled: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountOpError {
    #[error("invalid account index: {raw}")]
    InvalidIndex { raw: String },
    #[error("account index {index} is out of range (1..={len})")]
    OutOfRange { index: usize, len: usize },
    #[error("account at index {index} is disabled")]
    TargetDisabled { index: usize },
}

pub fn list_accounts_for_tools(domain: &OAuthDomain) -> Vec<AccountRow> {
    domain
        .accounts
        .iter()
        .enumerate()
        .map(|(i, account)| AccountRow {
            display_index: i + 1,
            identity_key: account.identity_key.clone(),
            email: account.email.clone(),
            plan: account.plan.clone(),
            label: account.display_label(),
            enabled: account.enabled,
            is_active: domain.active_identity_key.as_deref() == Some(&account.identity_key),
        })
        .collect()
}

/// Parse a user-supplied display index. Rejects anything that is not a
/// positive integer.
pub fn parse_display_index(raw: &str) -> Result<usize, AccountOpError> {
    let trimmed = raw.trim();
    match trimmed.parse::<i64>() {
        Ok(index) if index >= 1 => Ok(index as usize),
        _ => Err(AccountOpError::InvalidIndex {
            raw: raw.to_string(),
        }),
    }
}

fn check_index(domain: &OAuthDomain, index: usize) -> Result<usize, AccountOpError> {
    if index == 0 || index > domain.accounts.len() {
        return Err(AccountOpError::OutOfRange {
            index,
            len: domain.accounts.len(),
        });
    }
    Ok(index - 1)
}

/// Make the row at `index` the active account. Refuses disabled targets.
pub fn switch_account_by_index(
    domain: &OAuthDomain,
    index: usize,
) -> Result<OAuthDomain, AccountOpError> {
    let row = check_index(domain, index)?;
    if !domain.accounts[row].enabled {
        return Err(AccountOpError::TargetDisabled { index });
    }
    let mut next = domain.clone();
    next.active_identity_key = Some(next.accounts[row].identity_key.clone());
    Ok(next)
}

/// Flip the row's enabled flag. Disabling the active row moves the active
/// pointer to the first remaining enabled account.
pub fn toggle_account_enabled_by_index(
    domain: &OAuthDomain,
    index: usize,
) -> Result<OAuthDomain, AccountOpError> {
    let row = check_index(domain, index)?;
    let mut next = domain.clone();
    next.accounts[row].enabled = !next.accounts[row].enabled;

    let was_active = next.active_identity_key.as_deref()
        == Some(next.accounts[row].identity_key.as_str());
    if !next.accounts[row].enabled && was_active {
        next.active_identity_key = next
            .accounts
            .iter()
            .find(|a| a.enabled)
            .map(|a| a.identity_key.clone());
    }
    Ok(next)
}

/// Remove the row. When the removed row was active, the nearest enabled
/// neighbor (by row distance, earlier row on ties) becomes active.
pub fn remove_account_by_index(
    domain: &OAuthDomain,
    index: usize,
) -> Result<OAuthDomain, AccountOpError> {
    let row = check_index(domain, index)?;
    let mut next = domain.clone();
    let removed = next.accounts.remove(row);
    let was_active = next.active_identity_key.as_deref() == Some(removed.identity_key.as_str());
    if was_active {
        next.active_identity_key = nearest_enabled(&next, row);
    }
    Ok(next)
}

fn nearest_enabled(domain: &OAuthDomain, removed_row: usize) -> Option<String> {
    domain
        .accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| a.enabled)
        .min_by_key(|(i, _)| {
            // Distance to the hole left by the removed row; rows after it
            // have already shifted up by one.
            let distance = if *i >= removed_row {
                *i - removed_row
            } else {
                removed_row - *i - 1
            };
            (distance, *i)
        })
        .map(|(_, a)| a.identity_key.clone())
}
