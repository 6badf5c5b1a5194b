// src/services/user_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::user::{is_e164, CreateUserRequest, SwitchRoleRequest, User, UserResponse, UserRole},
    services::store::EntityStore,
    utils::id_generator::{IdGenerator, IdType, WithGeneratedId},
};

#[async_trait]
pub trait UserOperations: Send + Sync {
    async fn register_user(&self, registration: CreateUserRequest) -> DispatchResult<UserResponse>;
    async fn get_user(&self, user_id: &str) -> DispatchResult<Option<UserResponse>>;
    async fn switch_role(&self, user_id: &str, request: SwitchRoleRequest) -> DispatchResult<UserResponse>;
}

pub struct UserService {
    store: Arc<EntityStore>,
}

impl UserService {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store }
    }

    pub async fn require_user(&self, user_id: &str) -> DispatchResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| DispatchError::user_not_found(user_id))
    }

    /// The role switch refuses while the user has work in flight on either
    /// side: an active ride request as a traveller, or an active trip as a
    /// rider.
    async fn assert_no_active_engagement(&self, user: &User) -> DispatchResult<()> {
        if let Some(request) = self.store.active_request_for_traveller(&user.id).await? {
            return Err(DispatchError::RoleSwitchBlocked(format!(
                "active ride request {} must finish first",
                request.id
            )));
        }
        if let Some(trip) = self.store.active_trip_for_rider(&user.id).await? {
            return Err(DispatchError::RoleSwitchBlocked(format!(
                "active trip {} must finish first",
                trip.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UserOperations for UserService {
    async fn register_user(&self, registration: CreateUserRequest) -> DispatchResult<UserResponse> {
        tracing::info!("Registering user: {}", registration.phone);

        if registration.name.trim().is_empty() {
            return Err(DispatchError::validation_error("name", "Name must not be empty"));
        }
        if !is_e164(&registration.phone) {
            return Err(DispatchError::validation_error(
                "phone",
                "Phone must be E.164 format, e.g. +919862045511",
            ));
        }
        if self.store.find_user_by_phone(&registration.phone).await?.is_some() {
            return Err(DispatchError::validation_error(
                "phone",
                "A user already exists with this phone number",
            ));
        }

        let mut user = User {
            id: String::new(),
            name: registration.name.trim().to_string(),
            phone: registration.phone,
            role: registration.role,
            rating_average: 0.0,
            rating_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        user.set_generated_id(IdType::User);

        self.store.put_user(&user).await?;

        tracing::info!("User registered: {} ({})", user.id, user.role.as_str());
        Ok(UserResponse::from(user))
    }

    async fn get_user(&self, user_id: &str) -> DispatchResult<Option<UserResponse>> {
        if !IdGenerator::validate_id(user_id, Some(IdType::User)) {
            tracing::warn!("Invalid user ID format: {}", user_id);
            return Ok(None);
        }
        Ok(self.store.get_user(user_id).await?.map(UserResponse::from))
    }

    async fn switch_role(&self, user_id: &str, request: SwitchRoleRequest) -> DispatchResult<UserResponse> {
        tracing::info!("Role switch for {}: -> {}", user_id, request.target_role.as_str());

        let mut user = self.require_user(user_id).await?;

        if user.role == request.target_role {
            return Ok(UserResponse::from(user));
        }
        if request.target_role == UserRole::Admin || user.role == UserRole::Admin {
            return Err(DispatchError::RoleSwitchBlocked(
                "Admin role cannot be entered or left via role switch".to_string(),
            ));
        }
        if request.target_role == UserRole::Rider
            && self.store.vehicle_by_owner(user_id).await?.is_none()
        {
            return Err(DispatchError::RoleSwitchBlocked(
                "A registered vehicle is required before switching to the rider role".to_string(),
            ));
        }

        self.assert_no_active_engagement(&user).await?;

        user.role = request.target_role;
        user.updated_at = Utc::now();
        self.store.put_user(&user).await?;

        tracing::info!("User {} is now {}", user.id, user.role.as_str());
        Ok(UserResponse::from(user))
    }
}
