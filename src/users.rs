//! User accounts: validation, password hashing and the rules around the
//! protected superadmin.

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::database::{Database, NewUser, Role, UserChanges, UserRecord};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_role() -> Role {
    Role::Docente
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPasswordRequest {
    pub new_password: String,
}

pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(3..=50).contains(&len) {
        return Err(AppError::Validation(
            "username must be between 3 and 50 characters".to_string(),
        ));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(AppError::Validation("username must not contain spaces".to_string()));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(6..=100).contains(&len) {
        return Err(AppError::Validation(
            "password must be between 6 and 100 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("'{}' is not a valid email address", email)))
    }
}

pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(AppError::from)
}

pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let (password, hash) = (password.to_string(), hash.to_string());
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(AppError::from)
}

#[derive(Clone)]
pub struct UserService {
    db: Database,
    config: AuthConfig,
}

impl UserService {
    pub fn new(db: Database, config: AuthConfig) -> Self {
        Self { db, config }
    }

    pub fn is_superadmin(&self, user: &UserRecord) -> bool {
        user.username == self.config.superadmin_username
    }

    pub async fn get(&self, id: i64) -> Result<UserRecord> {
        self.db
            .find_user_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))
    }

    /// Everyone except the superadmin.
    pub async fn list(&self) -> Result<Vec<UserRecord>> {
        Ok(self.db.list_users(&self.config.superadmin_username).await?)
    }

    async fn ensure_unique(&self, username: Option<&str>, email: Option<&str>) -> Result<()> {
        if let Some(username) = username {
            if self.db.find_user_by_username(username).await?.is_some() {
                return Err(AppError::Duplicate(format!("username '{}' is already taken", username)));
            }
        }
        if let Some(email) = email {
            if self.db.find_user_by_email(email).await?.is_some() {
                return Err(AppError::Duplicate(format!("email '{}' is already registered", email)));
            }
        }
        Ok(())
    }

    pub async fn create(&self, request: CreateUserRequest) -> Result<UserRecord> {
        let username = request.username.trim().to_string();
        let email = request.email.trim().to_lowercase();
        validate_username(&username)?;
        validate_email(&email)?;
        validate_password(&request.password)?;
        self.ensure_unique(Some(&username), Some(&email)).await?;

        let password_hash = hash_password(&request.password, self.config.bcrypt_cost).await?;
        let user = self
            .db
            .insert_user(&NewUser {
                username,
                email,
                password_hash,
                first_name: request.first_name,
                last_name: request.last_name,
                role: request.role,
                is_active: request.is_active,
            })
            .await?;

        info!(user_id = user.id, username = %user.username, role = ?user.role, "user created");
        Ok(user)
    }

    /// Self-service sign-up always yields a docente account.
    pub async fn register(&self, request: RegisterRequest) -> Result<UserRecord> {
        if !self.config.allow_registration {
            return Err(AppError::Forbidden("registration is disabled".to_string()));
        }
        self.create(CreateUserRequest {
            username: request.username,
            email: request.email,
            password: request.password,
            first_name: request.first_name,
            last_name: request.last_name,
            role: Role::Docente,
            is_active: true,
        })
        .await
    }

    fn guard_superadmin(&self, user: &UserRecord) -> Result<()> {
        if self.is_superadmin(user) {
            return Err(AppError::Forbidden(
                "the superadmin account cannot be modified".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn update(&self, id: i64, request: UpdateUserRequest) -> Result<UserRecord> {
        let current = self.get(id).await?;
        self.guard_superadmin(&current)?;

        let username = request
            .username
            .map(|u| u.trim().to_string())
            .filter(|u| *u != current.username);
        let email = request
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| *e != current.email);

        if let Some(username) = &username {
            validate_username(username)?;
            if username == &self.config.superadmin_username {
                return Err(AppError::Duplicate(format!("username '{}' is already taken", username)));
            }
        }
        if let Some(email) = &email {
            validate_email(email)?;
        }
        self.ensure_unique(username.as_deref(), email.as_deref()).await?;

        let changes = UserChanges {
            username,
            email,
            first_name: request.first_name,
            last_name: request.last_name,
            role: request.role,
            is_active: request.is_active,
        };
        let user = self
            .db
            .update_user(id, &changes)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {} not found", id)))?;

        info!(user_id = id, "user updated");
        Ok(user)
    }

    /// Self-service change; the current password must match.
    pub async fn change_own_password(&self, user: &UserRecord, request: ChangePasswordRequest) -> Result<()> {
        if !verify_password(&request.old_password, &user.password_hash).await? {
            return Err(AppError::InvalidCredentials);
        }
        validate_password(&request.new_password)?;
        let hash = hash_password(&request.new_password, self.config.bcrypt_cost).await?;
        self.db.set_password_hash(user.id, &hash).await?;
        info!(user_id = user.id, "password changed");
        Ok(())
    }

    pub async fn set_password(&self, id: i64, request: SetPasswordRequest) -> Result<()> {
        let user = self.get(id).await?;
        self.guard_superadmin(&user)?;
        validate_password(&request.new_password)?;
        let hash = hash_password(&request.new_password, self.config.bcrypt_cost).await?;
        self.db.set_password_hash(id, &hash).await?;
        info!(user_id = id, "password reset by administrator");
        Ok(())
    }

    pub async fn delete(&self, actor: &UserRecord, id: i64) -> Result<()> {
        let user = self.get(id).await?;
        self.guard_superadmin(&user)?;
        if actor.id == id {
            return Err(AppError::Forbidden("you cannot delete your own account".to_string()));
        }
        self.db.delete_user(id).await?;
        info!(user_id = id, deleted_by = actor.id, "user deleted");
        Ok(())
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord> {
        let user = match self.db.find_user_by_username(username.trim()).await? {
            Some(user) => user,
            None => {
                warn!(username, "login attempt for unknown user");
                return Err(AppError::InvalidCredentials);
            }
        };
        if !verify_password(password, &user.password_hash).await? {
            warn!(username, "login attempt with wrong password");
            return Err(AppError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AppError::InactiveUser);
        }

        self.db.touch_last_login(user.id).await?;
        Ok(user)
    }

    /// Creates the superadmin on first start when a password is configured.
    pub async fn ensure_superadmin(&self) -> Result<Option<UserRecord>> {
        let Some(password) = self.config.superadmin_password.clone() else {
            return Ok(None);
        };
        if let Some(existing) = self.db.find_user_by_username(&self.config.superadmin_username).await? {
            return Ok(Some(existing));
        }

        validate_password(&password)?;
        let password_hash = hash_password(&password, self.config.bcrypt_cost).await?;
        let user = self
            .db
            .insert_user(&NewUser {
                username: self.config.superadmin_username.clone(),
                email: self.config.superadmin_email.clone(),
                password_hash,
                first_name: Some("Super".to_string()),
                last_name: Some("Administrador".to_string()),
                role: Role::Administrador,
                is_active: true,
            })
            .await?;

        info!(username = %user.username, "superadmin account created");
        Ok(Some(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            bcrypt_cost: 4,
            superadmin_password: Some("s3cret-admin".to_string()),
            ..AuthConfig::default()
        }
    }

    async fn service() -> UserService {
        let db = Database::in_memory().await.unwrap();
        UserService::new(db, auth_config())
    }

    fn request(username: &str, email: &str) -> CreateUserRequest {
        CreateUserRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: "docente123".to_string(),
            first_name: None,
            last_name: None,
            role: Role::Docente,
            is_active: true,
        }
    }

    #[test]
    fn field_validation() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"x".repeat(51)).is_err());
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        assert!(validate_email("ana@colegio.edu.pe").is_ok());
        assert!(validate_email("ana.colegio").is_err());
        assert!(validate_email("@colegio.pe").is_err());
        assert!(validate_email("ana@colegio").is_err());
    }

    #[tokio::test]
    async fn duplicate_username_and_email_are_rejected() {
        let users = service().await;
        users.create(request("mflores", "mflores@colegio.pe")).await.unwrap();

        let err = users
            .create(request("mflores", "otro@colegio.pe"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate(ref msg) if msg.contains("username")));

        let err = users
            .create(request("mflores2", "MFLORES@colegio.pe"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate(ref msg) if msg.contains("email")));
    }

    #[tokio::test]
    async fn authenticate_checks_password_and_active_flag() {
        let users = service().await;
        let user = users.create(request("mflores", "mflores@colegio.pe")).await.unwrap();

        assert!(matches!(
            users.authenticate("mflores", "wrong-pass").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            users.authenticate("nadie", "docente123").await,
            Err(AppError::InvalidCredentials)
        ));

        let logged_in = users.authenticate("mflores", "docente123").await.unwrap();
        assert_eq!(logged_in.id, user.id);

        users
            .update(
                user.id,
                UpdateUserRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            users.authenticate("mflores", "docente123").await,
            Err(AppError::InactiveUser)
        ));
    }

    #[tokio::test]
    async fn superadmin_is_protected() {
        let users = service().await;
        let admin = users.ensure_superadmin().await.unwrap().unwrap();
        assert!(admin.is_admin());

        let other = users
            .create(CreateUserRequest {
                role: Role::Administrador,
                ..request("jefe", "jefe@colegio.pe")
            })
            .await
            .unwrap();

        assert!(matches!(users.delete(&other, admin.id).await, Err(AppError::Forbidden(_))));
        assert!(matches!(
            users.update(admin.id, UpdateUserRequest::default()).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            users
                .set_password(admin.id, SetPasswordRequest { new_password: "nuevo123".into() })
                .await,
            Err(AppError::Forbidden(_))
        ));
        assert!(users.list().await.unwrap().iter().all(|u| u.id != admin.id));

        // a second bootstrap keeps the existing account
        let again = users.ensure_superadmin().await.unwrap().unwrap();
        assert_eq!(again.id, admin.id);
    }

    #[tokio::test]
    async fn admins_cannot_delete_themselves() {
        let users = service().await;
        let admin = users
            .create(CreateUserRequest {
                role: Role::Administrador,
                ..request("jefe", "jefe@colegio.pe")
            })
            .await
            .unwrap();
        assert!(matches!(users.delete(&admin, admin.id).await, Err(AppError::Forbidden(_))));

        let teacher = users.create(request("mflores", "mflores@colegio.pe")).await.unwrap();
        users.delete(&admin, teacher.id).await.unwrap();
        assert!(matches!(users.get(teacher.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn own_password_change_requires_old_password() {
        let users = service().await;
        let user = users.create(request("mflores", "mflores@colegio.pe")).await.unwrap();

        let wrong = ChangePasswordRequest {
            old_password: "nope".to_string(),
            new_password: "nueva-clave".to_string(),
        };
        assert!(matches!(
            users.change_own_password(&user, wrong).await,
            Err(AppError::InvalidCredentials)
        ));

        let right = ChangePasswordRequest {
            old_password: "docente123".to_string(),
            new_password: "nueva-clave".to_string(),
        };
        users.change_own_password(&user, right).await.unwrap();
        assert!(users.authenticate("mflores", "nueva-clave").await.is_ok());
    }

    #[tokio::test]
    async fn registration_forces_docente_role() {
        let users = service().await;
        let user = users
            .register(RegisterRequest {
                username: "nuevo".to_string(),
                email: "nuevo@colegio.pe".to_string(),
                password: "clave123".to_string(),
                first_name: None,
                last_name: None,
            })
            .await
            .unwrap();
        assert_eq!(user.role, Role::Docente);
    }

    #[tokio::test]
    async fn registration_can_be_disabled() {
        let db = Database::in_memory().await.unwrap();
        let users = UserService::new(
            db,
            AuthConfig {
                allow_registration: false,
                ..auth_config()
            },
        );
        let result = users
            .register(RegisterRequest {
                username: "nuevo".to_string(),
                email: "nuevo@colegio.pe".to_string(),
                password: "clave123".to_string(),
                first_name: None,
                last_name: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert!(users.authenticate("nuevo", "clave123").await.is_err());
    }
}
