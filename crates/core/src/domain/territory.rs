use serde::{Deserialize, Serialize};

use crate::domain::{TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Territory {
    pub tenant_id: TenantId,
    pub name: String,
    pub members: Vec<UserId>,
}

impl Territory {
    /// Member at a round-robin position. `None` for an empty territory.
    pub fn member_at(&self, position: u64) -> Option<&UserId> {
        if self.members.is_empty() {
            return None;
        }
        let index = (position % self.members.len() as u64) as usize;
        self.members.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::Territory;
    use crate::domain::{TenantId, UserId};

    #[test]
    fn member_at_wraps_around() {
        let territory = Territory {
            tenant_id: TenantId("T-1".to_string()),
            name: "north".to_string(),
            members: vec![UserId("U-1".to_string()), UserId("U-2".to_string())],
        };

        assert_eq!(territory.member_at(0).map(|id| id.0.as_str()), Some("U-1"));
        assert_eq!(territory.member_at(1).map(|id| id.0.as_str()), Some("U-2"));
        assert_eq!(territory.member_at(2).map(|id| id.0.as_str()), Some("U-1"));

        let empty = Territory { members: Vec::new(), ..territory };
        assert_eq!(empty.member_at(5), None);
    }
}
