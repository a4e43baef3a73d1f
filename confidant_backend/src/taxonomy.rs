//! Memory category taxonomy and the classification guidance pushed to the
//! episodic backend at provisioning time.

pub const PERSONAL_DETAILS: &str = "personal_details";
pub const INTIMATE_LIFE: &str = "intimate_life";
pub const USER_INTERESTS: &str = "user_interests";
pub const USER_PREFERENCES: &str = "user_preferences";
pub const USER_MOOD: &str = "user_mood";
pub const LIFE_EVENTS: &str = "life_events";
pub const PROFESSIONAL_DETAILS: &str = "professional_details";
pub const DAILY_ROUTINE: &str = "daily_routine";
pub const ACHIEVEMENTS: &str = "achievements";
pub const CHALLENGES: &str = "challenges";
pub const FUTURE_PLANS: &str = "future_plans";
pub const RELATIONSHIPS: &str = "relationships";
pub const OPINIONS: &str = "opinions";
pub const LEARNING: &str = "learning";
pub const FAVORITES: &str = "favorites";
pub const PET_PEEVES: &str = "pet_peeves";
pub const BUCKET_LIST: &str = "bucket_list";
pub const HEALTH: &str = "health";
pub const SEXUAL_HEALTH: &str = "sexual_health";

/// Written by the orchestrator itself (refusals); never assigned by the backend.
pub const CHATBOT_INTERACTIONS: &str = "chatbot_interactions";

pub const CATEGORIES: &[(&str, &str)] = &[
    (PERSONAL_DETAILS, "Name, age, gender, location, occupation or other direct personal identification."),
    (INTIMATE_LIFE, "Romantic or sexual relationships, preferences and experiences, only when explicitly mentioned."),
    (USER_INTERESTS, "Hobbies, passions and preferred activities."),
    (USER_PREFERENCES, "General likes and dislikes, excluding intimate preferences."),
    (USER_MOOD, "The user's emotional state including detected mood, its intensity and reasons."),
    (LIFE_EVENTS, "Significant milestones such as graduations, relocations or career changes."),
    (PROFESSIONAL_DETAILS, "Current job, position, company, salary and work schedule."),
    (DAILY_ROUTINE, "Regular schedule, habits and daily activities."),
    (ACHIEVEMENTS, "Accomplishments in any area of life."),
    (CHALLENGES, "Difficulties the user is facing or has overcome."),
    (FUTURE_PLANS, "Goals, dreams and plans for the near or distant future."),
    (RELATIONSHIPS, "Family, friends and social circle, excluding romantic partners."),
    (OPINIONS, "Views and beliefs on politics, ethics, philosophy and other topics."),
    (LEARNING, "Topics or skills the user is learning or wants to learn."),
    (FAVORITES, "Favorite books, movies, brands and other items."),
    (PET_PEEVES, "Things that consistently annoy the user."),
    (BUCKET_LIST, "Experiences the user wants to have in their lifetime."),
    (HEALTH, "Physical and mental health, excluding sexual health."),
    (SEXUAL_HEALTH, "Sexual wellbeing and related health matters, only when explicitly mentioned."),
];

pub const CLASSIFICATION_GUIDANCE: &str = "\
Extract and categorize information from user conversations, taking extra care with sensitive topics.

- A relationship mentioned casually (\"my friend X\") belongs in 'relationships'; a romantic or sexual one (\"my partner X\") belongs in 'intimate_life'.
- General health and sexual health are strictly separate categories.
- Intimacy-related preferences are stored only under 'intimate_life'.
- Store the detected mood, its intensity and the likely reason under 'user_mood'.
- Note the timeframe for sensitive information and require higher certainty for intimate categories.
- When new information contradicts old information of the same kind, keep the historical version for sensitive data.";

pub fn is_known_category(category: &str) -> bool {
    category == CHATBOT_INTERACTIONS || CATEGORIES.iter().any(|(name, _)| *name == category)
}
