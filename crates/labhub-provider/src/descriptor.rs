//! Container group descriptor derived from a server record

use labhub_api::Server;
use labhub_util::{SubscriptionId, UserPrincipalName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource group every lab server container group lives in
pub const LAB_RESOURCE_GROUP: &str = "labhub-servers";

/// Identifies one user's container group at the provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerGroupDescriptor {
    pub subscription_id: SubscriptionId,
    pub resource_group: String,
    pub container_group: String,
    pub owner: UserPrincipalName,
}

impl ContainerGroupDescriptor {
    pub fn for_server(server: &Server) -> Self {
        Self {
            subscription_id: server.subscription_id.clone(),
            resource_group: LAB_RESOURCE_GROUP.to_string(),
            container_group: format!("labserver-{}", server.user_principal_name.alias()),
            owner: server.user_principal_name.clone(),
        }
    }
}

impl fmt::Display for ContainerGroupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/containerGroups/{}",
            self.subscription_id, self.resource_group, self.container_group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labhub_api::ServerPolicy;
    use labhub_util::UserPrincipalId;

    #[test]
    fn descriptor_from_server() {
        let server = Server::register(
            SubscriptionId::new("sub-42"),
            UserPrincipalName::new("Jane.Doe@contoso.com"),
            UserPrincipalId::new("oid-jane"),
            ServerPolicy::default(),
            labhub_util::now(),
        );

        let descriptor = ContainerGroupDescriptor::for_server(&server);
        assert_eq!(descriptor.container_group, "labserver-janedoe");
        assert_eq!(
            descriptor.to_string(),
            "/subscriptions/sub-42/resourceGroups/labhub-servers/containerGroups/labserver-janedoe"
        );
    }
}
