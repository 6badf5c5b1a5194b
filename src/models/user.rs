// src/models/user.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Traveller,   // Requests rides
    Rider,       // Drives a registered vehicle
    Admin,       // Platform operator
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Traveller => "TRAVELLER",
            UserRole::Rider => "RIDER",
            UserRole::Admin => "ADMIN",
        }
    }
}

/// Platform account. Identity fields are immutable after creation; the role
/// changes only through the explicit switch-role command, which refuses while
/// the user has an active request or trip in the other role.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub phone: String,           // E.164, unique across the platform
    pub role: UserRole,
    pub rating_average: f32,     // 0.0 until first rating
    pub rating_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub phone: String,
    pub role: UserRole,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchRoleRequest {
    pub target_role: UserRole,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub role: UserRole,
    pub rating_average: f32,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            phone: user.phone,
            role: user.role,
            rating_average: user.rating_average,
            created_at: user.created_at,
        }
    }
}

/// Minimal E.164 shape check: leading '+', then 8-15 digits, no leading zero.
pub fn is_e164(phone: &str) -> bool {
    let Some(rest) = phone.strip_prefix('+') else {
        return false;
    };
    rest.len() >= 8
        && rest.len() <= 15
        && rest.chars().all(|c| c.is_ascii_digit())
        && !rest.starts_with('0')
}
