//! Disc and ball physics: integration, wall bounces, collisions, goal detection
//!
//! Velocities are expressed in field units per tick.

use crate::ws::protocol::{EntityKindName, EntitySnapshot, Side};

/// Logical field width (short edges run along x)
pub const FIELD_WIDTH: f32 = 600.0;
/// Logical field height (goals sit on the top and bottom edges)
pub const FIELD_HEIGHT: f32 = 900.0;
/// Width of each goal mouth, centred on its short edge
pub const GOAL_WIDTH: f32 = 180.0;
/// How far past the goal line the ball's leading edge must travel
pub const GOAL_DEPTH: f32 = 10.0;

/// Speed below which an entity is considered at rest
pub const STOP_EPSILON: f32 = 0.05;
/// Hard ceiling on speed after any collision
pub const MAX_SPEED: f32 = 40.0;
/// Largest impulse a single flick may impart
pub const MAX_IMPULSE: f32 = 36.0;

pub const WALL_RESTITUTION: f32 = 0.8;
/// Soft stop for discs hitting the goal mouth
pub const GOAL_MOUTH_RESTITUTION: f32 = 0.35;
pub const COLLISION_RESTITUTION: f32 = 0.9;

/// Physical properties per entity class
#[derive(Debug, Clone, Copy)]
pub struct BodyStats {
    pub radius: f32,
    pub mass: f32,
    /// Velocity multiplier applied every tick
    pub friction: f32,
}

impl BodyStats {
    pub const DISC: BodyStats = BodyStats {
        radius: 28.0,
        mass: 3.0,
        friction: 0.94,
    };

    pub const BALL: BodyStats = BodyStats {
        radius: 16.0,
        mass: 1.0,
        friction: 0.975,
    };
}

/// Minimal 2D vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn dot(self, other: Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    pub fn scale(self, k: f32) -> Vec2 {
        Vec2::new(self.x * k, self.y * k)
    }

    pub fn add(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(self, other: Vec2) -> Vec2 {
        Vec2::new(self.x - other.x, self.y - other.y)
    }

    /// Shrink to `max` length if longer
    pub fn clamp_length(self, max: f32) -> Vec2 {
        let len = self.length();
        if len > max && len > 0.0 {
            self.scale(max / len)
        } else {
            self
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Disc display colors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorPair {
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Disc { owner: Side, colors: ColorPair },
    Ball,
}

/// A disc or the ball
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: u32,
    pub kind: EntityKind,
    pub pos: Vec2,
    pub vel: Vec2,
    pub stats: BodyStats,
}

impl Entity {
    pub fn disc(id: u32, owner: Side, colors: ColorPair, pos: Vec2) -> Self {
        Self {
            id,
            kind: EntityKind::Disc { owner, colors },
            pos,
            vel: Vec2::ZERO,
            stats: BodyStats::DISC,
        }
    }

    pub fn ball(id: u32, pos: Vec2) -> Self {
        Self {
            id,
            kind: EntityKind::Ball,
            pos,
            vel: Vec2::ZERO,
            stats: BodyStats::BALL,
        }
    }

    pub fn is_ball(&self) -> bool {
        matches!(self.kind, EntityKind::Ball)
    }

    pub fn owner(&self) -> Option<Side> {
        match &self.kind {
            EntityKind::Disc { owner, .. } => Some(*owner),
            EntityKind::Ball => None,
        }
    }

    pub fn speed(&self) -> f32 {
        self.vel.length()
    }

    pub fn is_moving(&self) -> bool {
        self.vel != Vec2::ZERO
    }

    pub fn to_snapshot(&self) -> EntitySnapshot {
        let (kind, owner, colors) = match &self.kind {
            EntityKind::Disc { owner, colors } => (
                EntityKindName::Disc,
                Some(*owner),
                Some([colors.primary.clone(), colors.secondary.clone()]),
            ),
            EntityKind::Ball => (EntityKindName::Ball, None, None),
        };
        EntitySnapshot {
            id: self.id,
            kind,
            owner,
            x: self.pos.x,
            y: self.pos.y,
            vx: self.vel.x,
            vy: self.vel.y,
            radius: self.stats.radius,
            colors,
        }
    }
}

/// The rectangular pitch
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub width: f32,
    pub height: f32,
    pub goal_width: f32,
}

impl Default for Field {
    fn default() -> Self {
        Self {
            width: FIELD_WIDTH,
            height: FIELD_HEIGHT,
            goal_width: GOAL_WIDTH,
        }
    }
}

impl Field {
    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width / 2.0, self.height / 2.0)
    }

    /// True if `x` lies inside the goal mouth interval
    pub fn in_goal_mouth(&self, x: f32) -> bool {
        let half = self.goal_width / 2.0;
        let mid = self.width / 2.0;
        x >= mid - half && x <= mid + half
    }
}

/// Physics system for moving entities
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance one tick: move, apply friction, snap tiny speeds to rest
    pub fn integrate(entity: &mut Entity) {
        entity.pos = entity.pos.add(entity.vel);
        entity.vel = entity.vel.scale(entity.stats.friction);
        if entity.speed() < STOP_EPSILON {
            entity.vel = Vec2::ZERO;
        }
    }

    /// Keep an entity on the field. The ball may leave through a goal mouth;
    /// discs are stopped softly at the mouth.
    pub fn reflect_boundary(entity: &mut Entity, field: &Field) {
        let r = entity.stats.radius;

        if entity.pos.x - r < 0.0 {
            entity.pos.x = r;
            entity.vel.x = -entity.vel.x * WALL_RESTITUTION;
        } else if entity.pos.x + r > field.width {
            entity.pos.x = field.width - r;
            entity.vel.x = -entity.vel.x * WALL_RESTITUTION;
        }

        let in_mouth = field.in_goal_mouth(entity.pos.x);
        if in_mouth && entity.is_ball() {
            return;
        }
        let restitution = if in_mouth {
            GOAL_MOUTH_RESTITUTION
        } else {
            WALL_RESTITUTION
        };

        if entity.pos.y - r < 0.0 {
            entity.pos.y = r;
            entity.vel.y = -entity.vel.y * restitution;
        } else if entity.pos.y + r > field.height {
            entity.pos.y = field.height - r;
            entity.vel.y = -entity.vel.y * restitution;
        }
    }

    /// Separate overlapping bodies and exchange momentum along the contact
    /// normal. Returns true if the bodies were touching.
    pub fn resolve_collision(a: &mut Entity, b: &mut Entity) -> bool {
        let delta = b.pos.sub(a.pos);
        let dist = delta.length();
        let min_dist = a.stats.radius + b.stats.radius;
        if dist >= min_dist {
            return false;
        }

        // Coincident centres: pick an arbitrary axis
        let normal = if dist < 1e-4 {
            Vec2::new(1.0, 0.0)
        } else {
            delta.scale(1.0 / dist)
        };

        let inv_a = 1.0 / a.stats.mass;
        let inv_b = 1.0 / b.stats.mass;
        let inv_total = inv_a + inv_b;

        // Lighter body moves further
        let overlap = min_dist - dist;
        a.pos = a.pos.sub(normal.scale(overlap * inv_a / inv_total));
        b.pos = b.pos.add(normal.scale(overlap * inv_b / inv_total));

        let closing = b.vel.sub(a.vel).dot(normal);
        if closing > 0.0 {
            // Already separating
            return true;
        }

        let j = -(1.0 + COLLISION_RESTITUTION) * closing / inv_total;
        a.vel = a.vel.sub(normal.scale(j * inv_a)).clamp_length(MAX_SPEED);
        b.vel = b.vel.add(normal.scale(j * inv_b)).clamp_length(MAX_SPEED);
        true
    }

    /// Which side scored, if the ball is through a goal mouth
    pub fn detect_goal(ball: &Entity, field: &Field) -> Option<Side> {
        if !field.in_goal_mouth(ball.pos.x) {
            return None;
        }
        let r = ball.stats.radius;
        if ball.pos.y - r < -GOAL_DEPTH {
            // Through the top goal, defended by the challenger
            Some(Side::Creator)
        } else if ball.pos.y + r > field.height + GOAL_DEPTH {
            Some(Side::Challenger)
        } else {
            None
        }
    }

    /// Everything has come to rest
    pub fn all_settled<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> bool {
        entities.into_iter().all(|e| !e.is_moving())
    }
}
