pub mod clarify;
pub mod list_conversations;

use std::sync::Arc;

use lumen_store::ConversationRepo;

use crate::registry::ToolRegistry;

/// Create a ToolRegistry with all built-in server-side tools.
pub fn create_default_registry(conversations: Arc<ConversationRepo>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // User interaction
    registry.register(Arc::new(clarify::ClarifyTool));

    // Conversation history
    registry.register(Arc::new(list_conversations::ListConversationsTool::new(
        conversations,
    )));

    registry
}
